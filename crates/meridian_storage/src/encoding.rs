//! Order-preserving key encoding.
//!
//! Keys are encoded to byte strings whose bytewise order equals the logical
//! key order, so storage can keep one `BTreeMap<Vec<u8>, _>` per table and a
//! single ascending scan yields the declared key order.
//!
//! Layout per component: a type tag, then a kind-specific payload.
//! - Integers are sign-flipped big-endian.
//! - Floats use the IEEE-754 bit trick (negative values bit-complemented).
//! - Strings and bytes escape interior 0x00 as 0x00 0xFF and terminate with
//!   0x00 0x01, so no component encoding is a proper byte-prefix of a
//!   different component encoding.
//! - NULL is a bare 0x00 tag, sorting before every value.
//!
//! A DESC key column complements its component bytes, which reverses the
//! component order and places NULLs last, matching descending index order.

use std::ops::Bound;

use meridian_common::datum::{DataType, Datum};
use meridian_common::error::{Error, Result};
use meridian_common::key::{Key, KeyRange, KeySet, SortOrder};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT64: u8 = 0x02;
const TAG_FLOAT64: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_TIMESTAMP: u8 = 0x06;
const TAG_DATE: u8 = 0x07;
const TAG_ARRAY: u8 = 0x08;

fn encode_datum(datum: &Datum, buf: &mut Vec<u8>) {
    match datum {
        Datum::Null => buf.push(TAG_NULL),
        Datum::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        Datum::Int64(v) => {
            buf.push(TAG_INT64);
            let flipped = (*v as u64) ^ (1u64 << 63);
            buf.extend_from_slice(&flipped.to_be_bytes());
        }
        Datum::Float64(v) => {
            buf.push(TAG_FLOAT64);
            let bits = v.to_bits();
            let ordered = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits ^ (1u64 << 63)
            };
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Datum::Text(s) => {
            buf.push(TAG_TEXT);
            encode_escaped(s.as_bytes(), buf);
        }
        Datum::Bytes(b) => {
            buf.push(TAG_BYTES);
            encode_escaped(b, buf);
        }
        Datum::Timestamp(us) => {
            buf.push(TAG_TIMESTAMP);
            let flipped = (*us as u64) ^ (1u64 << 63);
            buf.extend_from_slice(&flipped.to_be_bytes());
        }
        Datum::Date(days) => {
            buf.push(TAG_DATE);
            let flipped = (*days as u32) ^ (1u32 << 31);
            buf.extend_from_slice(&flipped.to_be_bytes());
        }
        Datum::Array(elems) => {
            // Arrays are rejected as key columns by schema validation; this
            // length-prefixed form only needs to be self-delimiting.
            buf.push(TAG_ARRAY);
            buf.extend_from_slice(&(elems.len() as u32).to_be_bytes());
            for elem in elems {
                encode_datum(elem, buf);
            }
        }
    }
}

/// Escape interior NULs (0x00 -> 0x00 0xFF) and terminate with 0x00 0x01.
fn encode_escaped(bytes: &[u8], buf: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x01);
}

/// Encode one key component, honoring its sort direction.
pub fn encode_component(datum: &Datum, order: SortOrder, buf: &mut Vec<u8>) {
    let start = buf.len();
    encode_datum(datum, buf);
    if order == SortOrder::Descending {
        for b in &mut buf[start..] {
            *b = !*b;
        }
    }
}

/// Encode a full key. Components beyond `orders` are ascending (the base
/// primary-key tail of an index entry is always stored ascending).
pub fn encode_key(key: &Key, orders: &[SortOrder]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() * 10);
    for (i, datum) in key.datums().iter().enumerate() {
        let order = orders.get(i).copied().unwrap_or(SortOrder::Ascending);
        encode_component(datum, order, &mut buf);
    }
    buf
}

/// Smallest byte string strictly greater than every extension of `prefix`.
/// `None` means no such string exists (the prefix is all 0xFF).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bytes = prefix.to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last != 0xFF {
            *last += 1;
            return Some(bytes);
        }
        bytes.pop();
    }
    None
}

/// A canonical encoded key range, ready for a storage scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl EncodedRange {
    pub fn all() -> Self {
        EncodedRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn point(key_bytes: Vec<u8>) -> Self {
        EncodedRange {
            start: Bound::Included(key_bytes.clone()),
            end: Bound::Included(key_bytes),
        }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
            (
                Bound::Included(s) | Bound::Excluded(s),
                Bound::Included(e) | Bound::Excluded(e),
            ) => {
                if s > e {
                    return true;
                }
                if s == e {
                    return !matches!(
                        (&self.start, &self.end),
                        (Bound::Included(_), Bound::Included(_))
                    );
                }
                false
            }
        }
    }

    pub fn contains(&self, key_bytes: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(s) => key_bytes >= s.as_slice(),
            Bound::Excluded(s) => key_bytes > s.as_slice(),
        };
        let before_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => key_bytes <= e.as_slice(),
            Bound::Excluded(e) => key_bytes < e.as_slice(),
        };
        after_start && before_end
    }
}

/// Range covering exactly the keys that extend `prefix` bytewise.
pub fn prefix_scan_range(prefix: &[u8]) -> EncodedRange {
    let end = match prefix_successor(prefix) {
        Some(s) => Bound::Excluded(s),
        None => Bound::Unbounded,
    };
    EncodedRange {
        start: Bound::Included(prefix.to_vec()),
        end,
    }
}

fn validate_endpoint(key: &Key, key_types: &[DataType], what: &str) -> Result<()> {
    if key.len() > key_types.len() {
        return Err(Error::invalid_argument(format!(
            "{} key {} has {} components, key has only {} columns",
            what,
            key,
            key.len(),
            key_types.len()
        )));
    }
    for (datum, ty) in key.datums().iter().zip(key_types.iter()) {
        if !datum.matches_type(ty) {
            return Err(Error::invalid_argument(format!(
                "{} key {} component {} does not match column type {}",
                what, key, datum, ty
            )));
        }
    }
    Ok(())
}

/// `None` means nothing lies at or after this start (skipping the last
/// possible prefix group).
fn encode_start(
    key: &Key,
    closed: bool,
    full_arity: usize,
    orders: &[SortOrder],
) -> Option<Bound<Vec<u8>>> {
    let enc = encode_key(key, orders);
    if closed {
        Some(Bound::Included(enc))
    } else if key.len() == full_arity {
        Some(Bound::Excluded(enc))
    } else {
        // Open start on a prefix skips the whole prefix group.
        prefix_successor(&enc).map(Bound::Included)
    }
}

/// `None` means the endpoint admits every suffix (unbounded above).
fn encode_end(
    key: &Key,
    closed: bool,
    full_arity: usize,
    orders: &[SortOrder],
) -> Option<Bound<Vec<u8>>> {
    let enc = encode_key(key, orders);
    if key.len() == full_arity {
        if closed {
            Some(Bound::Included(enc))
        } else {
            Some(Bound::Excluded(enc))
        }
    } else if closed {
        // Closed end on a prefix includes the whole prefix group.
        match prefix_successor(&enc) {
            Some(s) => Some(Bound::Excluded(s)),
            None => None,
        }
    } else {
        Some(Bound::Excluded(enc))
    }
}

fn cmp_start(a: &Bound<Vec<u8>>, b: &Bound<Vec<u8>>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            x.cmp(y).then_with(|| match (a, b) {
                (Bound::Included(_), Bound::Excluded(_)) => Ordering::Less,
                (Bound::Excluded(_), Bound::Included(_)) => Ordering::Greater,
                _ => Ordering::Equal,
            })
        }
    }
}

fn cmp_end(a: &Bound<Vec<u8>>, b: &Bound<Vec<u8>>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            x.cmp(y).then_with(|| match (a, b) {
                (Bound::Excluded(_), Bound::Included(_)) => Ordering::Less,
                (Bound::Included(_), Bound::Excluded(_)) => Ordering::Greater,
                _ => Ordering::Equal,
            })
        }
    }
}

/// True when a range starting at `start` begins at or before (or adjacent to)
/// a range ending at `end`, so the two can be merged into one.
fn joins(end: &Bound<Vec<u8>>, start: &Bound<Vec<u8>>) -> bool {
    match (end, start) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(e) | Bound::Excluded(e), Bound::Included(s) | Bound::Excluded(s)) => {
            if s < e {
                true
            } else if s > e {
                false
            } else {
                // Touching endpoints: contiguous unless both sides exclude
                // the shared key.
                !matches!((end, start), (Bound::Excluded(_), Bound::Excluded(_)))
            }
        }
    }
}

/// Canonicalize a key set against a concrete key layout: validate endpoint
/// types and arity, encode, sort ascending, and merge overlapping or
/// adjacent ranges. Point keys must name a full key; range endpoints may be
/// prefixes.
pub fn canonicalize_key_set(
    set: &KeySet,
    key_types: &[DataType],
    orders: &[SortOrder],
) -> Result<Vec<EncodedRange>> {
    let full_arity = key_types.len();
    let mut ranges: Vec<EncodedRange> = Vec::new();

    for point in set.point_keys() {
        validate_endpoint(point, key_types, "point")?;
        if point.len() != full_arity {
            return Err(Error::invalid_argument(format!(
                "point key {} must have exactly {} components",
                point, full_arity
            )));
        }
        ranges.push(EncodedRange::point(encode_key(point, orders)));
    }

    for range in set.key_ranges() {
        let start = match &range.start {
            None => Bound::Unbounded,
            Some(key) => {
                validate_endpoint(key, key_types, "range start")?;
                match encode_start(key, range.start_closed, full_arity, orders) {
                    Some(b) => b,
                    None => continue, // nothing lies past this start
                }
            }
        };
        let end = match &range.end {
            None => Bound::Unbounded,
            Some(key) => {
                validate_endpoint(key, key_types, "range end")?;
                match encode_end(key, range.end_closed, full_arity, orders) {
                    Some(b) => b,
                    None => Bound::Unbounded,
                }
            }
        };
        let encoded = EncodedRange { start, end };
        if !encoded.is_empty() {
            ranges.push(encoded);
        }
    }

    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| cmp_start(&a.start, &b.start));

    let mut merged: Vec<EncodedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if joins(&last.end, &range.start) => {
                if cmp_end(&range.end, &last.end) == std::cmp::Ordering::Greater {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    Ok(merged)
}
