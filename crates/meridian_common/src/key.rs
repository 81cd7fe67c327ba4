use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::datum::Datum;

/// Per-column sort direction for key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// An ordered sequence of values addressing a row of a table or an entry of
/// an index. Keys compare lexicographically with NULL-first per component;
/// a key that is a proper prefix of another sorts before it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Key(Vec<Datum>);

impl Key {
    pub fn new(datums: Vec<Datum>) -> Self {
        Key(datums)
    }

    pub fn empty() -> Self {
        Key(Vec::new())
    }

    pub fn datums(&self) -> &[Datum] {
        &self.0
    }

    pub fn into_datums(self) -> Vec<Datum> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, d: Datum) {
        self.0.push(d);
    }

    /// Concatenation: `self` followed by `tail`.
    pub fn concat(&self, tail: &Key) -> Key {
        let mut datums = self.0.clone();
        datums.extend_from_slice(&tail.0);
        Key(datums)
    }
}

impl From<Vec<Datum>> for Key {
    fn from(datums: Vec<Datum>) -> Self {
        Key(datums)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.key_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}

/// A contiguous range of keys with per-endpoint open/closed flags. Endpoints
/// may be full keys or key prefixes; a `None` endpoint is unbounded. Prefix
/// endpoints address the whole group of keys extending the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<Key>,
    pub start_closed: bool,
    pub end: Option<Key>,
    pub end_closed: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange {
            start: None,
            start_closed: true,
            end: None,
            end_closed: false,
        }
    }

    pub fn closed_open(start: Key, end: Key) -> Self {
        KeyRange {
            start: Some(start),
            start_closed: true,
            end: Some(end),
            end_closed: false,
        }
    }

    pub fn closed_closed(start: Key, end: Key) -> Self {
        KeyRange {
            start: Some(start),
            start_closed: true,
            end: Some(end),
            end_closed: true,
        }
    }

    pub fn open_open(start: Key, end: Key) -> Self {
        KeyRange {
            start: Some(start),
            start_closed: false,
            end: Some(end),
            end_closed: false,
        }
    }

    pub fn open_closed(start: Key, end: Key) -> Self {
        KeyRange {
            start: Some(start),
            start_closed: false,
            end: Some(end),
            end_closed: true,
        }
    }

    /// Every key extending the given prefix (or exactly equal to it).
    pub fn prefix(key: Key) -> Self {
        KeyRange::closed_closed(key.clone(), key)
    }
}

/// A union of point keys and key ranges. Canonicalization (sorting and
/// merging of overlaps) happens at read time against a concrete key layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySet {
    points: Vec<Key>,
    ranges: Vec<KeyRange>,
}

impl KeySet {
    pub fn new() -> Self {
        KeySet::default()
    }

    /// The set covering every key of the table or index.
    pub fn all() -> Self {
        KeySet {
            points: Vec::new(),
            ranges: vec![KeyRange::all()],
        }
    }

    pub fn point(key: Key) -> Self {
        KeySet {
            points: vec![key],
            ranges: Vec::new(),
        }
    }

    pub fn points<I: IntoIterator<Item = Key>>(keys: I) -> Self {
        KeySet {
            points: keys.into_iter().collect(),
            ranges: Vec::new(),
        }
    }

    pub fn range(range: KeyRange) -> Self {
        KeySet {
            points: Vec::new(),
            ranges: vec![range],
        }
    }

    pub fn add_point(&mut self, key: Key) -> &mut Self {
        self.points.push(key);
        self
    }

    pub fn add_range(&mut self, range: KeyRange) -> &mut Self {
        self.ranges.push(range);
        self
    }

    pub fn point_keys(&self) -> &[Key] {
        &self.points
    }

    pub fn key_ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.ranges.is_empty()
    }
}
