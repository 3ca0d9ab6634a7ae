//! The `Mixed` value domain.

use crate::types::ObjKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A point in time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Creates a timestamp.
    #[must_use]
    pub const fn new(seconds: i64, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }
}

/// A tagged value stored in columns and dictionaries.
///
/// Ordering is total: values of different kinds order by kind
/// (null < bool < int < float < double < string < binary < timestamp < link),
/// values of the same kind by content. Floating point content compares with
/// `total_cmp`, so `NaN` equals itself and sorts deterministically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Mixed {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Single precision float.
    Float(f32),
    /// Double precision float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Opaque bytes.
    Binary(Bytes),
    /// Timestamp.
    Timestamp(Timestamp),
    /// Link to an object of the column's target table.
    Link(ObjKey),
}

impl Mixed {
    fn rank(&self) -> u8 {
        match self {
            Mixed::Null => 0,
            Mixed::Bool(_) => 1,
            Mixed::Int(_) => 2,
            Mixed::Float(_) => 3,
            Mixed::Double(_) => 4,
            Mixed::String(_) => 5,
            Mixed::Binary(_) => 6,
            Mixed::Timestamp(_) => 7,
            Mixed::Link(_) => 8,
        }
    }

    /// Name of the value's kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Mixed::Null => "null",
            Mixed::Bool(_) => "bool",
            Mixed::Int(_) => "int",
            Mixed::Float(_) => "float",
            Mixed::Double(_) => "double",
            Mixed::String(_) => "string",
            Mixed::Binary(_) => "binary",
            Mixed::Timestamp(_) => "timestamp",
            Mixed::Link(_) => "link",
        }
    }

    /// Check if this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Mixed::Null)
    }

    /// Get this value as a boolean, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Mixed::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Mixed::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float, if it is one.
    #[must_use]
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Mixed::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a double, if it is one.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Mixed::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Mixed::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is binary.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Mixed::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a timestamp, if it is one.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Mixed::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Get the linked key, if this value is a link.
    #[must_use]
    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Mixed::Link(k) => Some(*k),
            _ => None,
        }
    }
}

impl Ord for Mixed {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Mixed::Null, Mixed::Null) => Ordering::Equal,
            (Mixed::Bool(a), Mixed::Bool(b)) => a.cmp(b),
            (Mixed::Int(a), Mixed::Int(b)) => a.cmp(b),
            (Mixed::Float(a), Mixed::Float(b)) => a.total_cmp(b),
            (Mixed::Double(a), Mixed::Double(b)) => a.total_cmp(b),
            (Mixed::String(a), Mixed::String(b)) => a.cmp(b),
            (Mixed::Binary(a), Mixed::Binary(b)) => a.cmp(b),
            (Mixed::Timestamp(a), Mixed::Timestamp(b)) => a.cmp(b),
            (Mixed::Link(a), Mixed::Link(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Mixed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Mixed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Mixed {}

impl Hash for Mixed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Mixed::Null => {}
            Mixed::Bool(b) => b.hash(state),
            Mixed::Int(n) => n.hash(state),
            Mixed::Float(n) => n.to_bits().hash(state),
            Mixed::Double(n) => n.to_bits().hash(state),
            Mixed::String(s) => s.hash(state),
            Mixed::Binary(b) => b.hash(state),
            Mixed::Timestamp(t) => t.hash(state),
            Mixed::Link(k) => k.hash(state),
        }
    }
}

impl fmt::Display for Mixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mixed::Null => write!(f, "null"),
            Mixed::Bool(b) => write!(f, "{b}"),
            Mixed::Int(n) => write!(f, "{n}"),
            Mixed::Float(n) => write!(f, "{n}"),
            Mixed::Double(n) => write!(f, "{n}"),
            Mixed::String(s) => write!(f, "{s:?}"),
            Mixed::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Mixed::Timestamp(t) => write!(f, "{}.{:09}", t.seconds, t.nanoseconds),
            Mixed::Link(k) => write!(f, "{k}"),
        }
    }
}

impl From<bool> for Mixed {
    fn from(b: bool) -> Self {
        Mixed::Bool(b)
    }
}

impl From<i64> for Mixed {
    fn from(n: i64) -> Self {
        Mixed::Int(n)
    }
}

impl From<i32> for Mixed {
    fn from(n: i32) -> Self {
        Mixed::Int(i64::from(n))
    }
}

impl From<f32> for Mixed {
    fn from(n: f32) -> Self {
        Mixed::Float(n)
    }
}

impl From<f64> for Mixed {
    fn from(n: f64) -> Self {
        Mixed::Double(n)
    }
}

impl From<String> for Mixed {
    fn from(s: String) -> Self {
        Mixed::String(s)
    }
}

impl From<&str> for Mixed {
    fn from(s: &str) -> Self {
        Mixed::String(s.to_string())
    }
}

impl From<Vec<u8>> for Mixed {
    fn from(b: Vec<u8>) -> Self {
        Mixed::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Mixed {
    fn from(b: &[u8]) -> Self {
        Mixed::Binary(Bytes::copy_from_slice(b))
    }
}

impl From<Timestamp> for Mixed {
    fn from(t: Timestamp) -> Self {
        Mixed::Timestamp(t)
    }
}

impl From<ObjKey> for Mixed {
    fn from(k: ObjKey) -> Self {
        Mixed::Link(k)
    }
}

impl From<()> for Mixed {
    fn from((): ()) -> Self {
        Mixed::Null
    }
}

impl<T: Into<Mixed>> From<Option<T>> for Mixed {
    fn from(v: Option<T>) -> Self {
        v.map_or(Mixed::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_order_before_content() {
        let mut values = vec![
            Mixed::from("a"),
            Mixed::from(10),
            Mixed::Null,
            Mixed::from(1.5f64),
            Mixed::from(false),
            Mixed::Link(ObjKey::new(0)),
        ];
        values.sort();
        assert_eq!(
            values.iter().map(Mixed::kind).collect::<Vec<_>>(),
            vec!["null", "bool", "int", "double", "string", "link"]
        );
    }

    #[test]
    fn int_and_double_are_distinct() {
        assert_ne!(Mixed::from(1), Mixed::from(1.0f64));
        assert!(Mixed::from(100) < Mixed::from(0.5f64));
    }

    #[test]
    fn nan_is_self_equal() {
        let nan = Mixed::from(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert!(Mixed::from(f64::INFINITY) < nan);
    }

    #[test]
    fn accessors() {
        assert!(Mixed::Null.is_null());
        assert_eq!(Mixed::from(9).as_int(), Some(9));
        assert_eq!(Mixed::from("x").as_str(), Some("x"));
        assert_eq!(Mixed::from(vec![1u8, 2]).as_binary(), Some(&[1u8, 2][..]));
        assert_eq!(Mixed::from(ObjKey::new(4)).as_link(), Some(ObjKey::new(4)));
        assert_eq!(Mixed::from(Some(3)), Mixed::Int(3));
        assert_eq!(Mixed::from(None::<i64>), Mixed::Null);
        assert_eq!(Mixed::from(9).as_str(), None);
    }

    #[test]
    fn display() {
        assert_eq!(Mixed::from("hi").to_string(), "\"hi\"");
        assert_eq!(Mixed::from(Timestamp::new(1, 5)).to_string(), "1.000000005");
    }
}
