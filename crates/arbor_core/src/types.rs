//! Core identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of an object within a table.
///
/// Keys are assigned from a per-table counter and never reused, so a key
/// stays meaningful for as long as anything (including backlinks) refers to
/// it. A key says nothing about where the object is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey(pub i64);

impl ObjKey {
    /// Creates an object key.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

impl From<i64> for ObjKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of a table within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey(pub u32);

impl TableKey {
    /// Creates a table key.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Position of the table in the group's top array.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Identifier of a column.
///
/// `index` addresses the column's slot inside every leaf (slot `index + 1`).
/// `tag` never changes for the lifetime of the column, which lets a table
/// notice a key that went stale after another column was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColKey {
    /// Position within the table's column list.
    pub index: u32,
    /// Stable column identity.
    pub tag: u32,
}

impl ColKey {
    /// Creates a column key.
    #[must_use]
    pub const fn new(index: u32, tag: u32) -> Self {
        Self { index, tag }
    }

    /// Position within the table's column list.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}#{}", self.index, self.tag)
    }
}

/// Committed version of the database.
///
/// Every commit produces the next version; readers pin the version they
/// started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// Creates a version.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_key_ordering_is_signed() {
        assert!(ObjKey::new(-1) < ObjKey::new(0));
        assert!(ObjKey::new(3) < ObjKey::new(10));
    }

    #[test]
    fn version_next() {
        assert_eq!(Version::new(4).next(), Version::new(5));
        assert_eq!(format!("{}", Version::new(4)), "v4");
    }

    #[test]
    fn col_key_display() {
        assert_eq!(format!("{}", ColKey::new(2, 7)), "col:2#7");
        assert_eq!(ColKey::new(2, 7).index(), 2);
    }
}
