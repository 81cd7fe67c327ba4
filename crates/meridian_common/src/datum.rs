use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single scalar value. This is the fundamental unit of data in meridiandb.
/// Small enum, no heap allocation for fixed-size kinds; dispatch on kind for
/// compare and encode, no virtual calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    /// Days since the Unix epoch (1970-01-01).
    Date(i32),
    Array(Vec<Datum>),
}

/// Declared column types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float64,
    Text,
    Bytes,
    Timestamp,
    Date,
    Array(Box<DataType>),
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "BOOL"),
            DataType::Int64 => write!(f, "INT64"),
            DataType::Float64 => write!(f, "FLOAT64"),
            DataType::Text => write!(f, "STRING"),
            DataType::Bytes => write!(f, "BYTES"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Date => write!(f, "DATE"),
            DataType::Array(inner) => write!(f, "ARRAY<{}>", inner),
        }
    }
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(DataType::Bool),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Bytes(_) => Some(DataType::Bytes),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Date(_) => Some(DataType::Date),
            Datum::Array(elems) => {
                let elem = elems
                    .iter()
                    .find_map(|d| d.data_type())
                    .unwrap_or(DataType::Text);
                Some(DataType::Array(Box::new(elem)))
            }
        }
    }

    /// Whether this value can be stored in a column of the given type.
    /// NULL matches every type.
    pub fn matches_type(&self, ty: &DataType) -> bool {
        match (self, ty) {
            (Datum::Null, _) => true,
            (Datum::Bool(_), DataType::Bool) => true,
            (Datum::Int64(_), DataType::Int64) => true,
            (Datum::Float64(_), DataType::Float64) => true,
            (Datum::Text(_), DataType::Text) => true,
            (Datum::Bytes(_), DataType::Bytes) => true,
            (Datum::Timestamp(_), DataType::Timestamp) => true,
            (Datum::Date(_), DataType::Date) => true,
            (Datum::Array(elems), DataType::Array(inner)) => {
                elems.iter().all(|d| d.matches_type(inner))
            }
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Total order used for key comparison: NULL sorts before every non-null
    /// value; values of the same kind compare naturally (floats via IEEE total
    /// order). Values of different kinds fall back to kind rank so the order
    /// stays total; typed schemas never mix kinds within one key column.
    pub fn key_cmp(&self, other: &Datum) -> Ordering {
        use Datum::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.key_cmp(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => kind_rank(a).cmp(&kind_rank(b)),
        }
    }

    /// Equality for uniqueness checks: NULL equals NULL, everything else uses
    /// `key_cmp`.
    pub fn index_eq(&self, other: &Datum) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

fn kind_rank(d: &Datum) -> u8 {
    match d {
        Datum::Null => 0,
        Datum::Bool(_) => 1,
        Datum::Int64(_) => 2,
        Datum::Float64(_) => 3,
        Datum::Text(_) => 4,
        Datum::Bytes(_) => 5,
        Datum::Timestamp(_) => 6,
        Datum::Date(_) => 7,
        Datum::Array(_) => 8,
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{:?}", s),
            Datum::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Datum::Timestamp(us) => write!(f, "ts:{}", us),
            Datum::Date(days) => write!(f, "date:{}", days),
            Datum::Array(elems) => {
                write!(f, "[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(Datum::Null.key_cmp(&Datum::Int64(i64::MIN)), Ordering::Less);
        assert_eq!(
            Datum::Null.key_cmp(&Datum::Text("".into())),
            Ordering::Less
        );
        assert_eq!(Datum::Null.key_cmp(&Datum::Null), Ordering::Equal);
    }

    #[test]
    fn test_same_kind_ordering() {
        assert_eq!(Datum::Int64(1).key_cmp(&Datum::Int64(2)), Ordering::Less);
        assert_eq!(
            Datum::Text("Adam".into()).key_cmp(&Datum::Text("John".into())),
            Ordering::Less
        );
        // Empty string is a value, not NULL.
        assert_eq!(
            Datum::Text("".into()).key_cmp(&Datum::Text("Adam".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_float_total_order() {
        assert_eq!(
            Datum::Float64(-1.0).key_cmp(&Datum::Float64(1.0)),
            Ordering::Less
        );
        // NaN participates in the total order rather than poisoning it.
        assert_eq!(
            Datum::Float64(f64::NAN).key_cmp(&Datum::Float64(f64::NAN)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_index_eq_treats_null_as_equal() {
        assert!(Datum::Null.index_eq(&Datum::Null));
        assert!(!Datum::Null.index_eq(&Datum::Int64(0)));
        assert!(Datum::Int64(7).index_eq(&Datum::Int64(7)));
    }

    #[test]
    fn test_matches_type() {
        assert!(Datum::Null.matches_type(&DataType::Int64));
        assert!(Datum::Int64(1).matches_type(&DataType::Int64));
        assert!(!Datum::Int64(1).matches_type(&DataType::Text));
        assert!(Datum::Array(vec![Datum::Int64(1), Datum::Null])
            .matches_type(&DataType::Array(Box::new(DataType::Int64))));
    }
}
