//! Persisted table schema.
//!
//! Schemas are plain data stored in a [`crate::alloc::Block::Schema`] block
//! hanging off each table's top array. Defining and validating schemas is the
//! job of the layer above; this module only records what the storage needs
//! to keep leaves aligned and links consistent.

use crate::error::{CoreError, CoreResult};
use crate::types::{ColKey, TableKey};
use crate::value::{Mixed, Timestamp};
use serde::{Deserialize, Serialize};

/// Type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit integer.
    Int,
    /// Boolean.
    Bool,
    /// Single precision float.
    Float,
    /// Double precision float.
    Double,
    /// UTF-8 string.
    String,
    /// Opaque bytes.
    Binary,
    /// Timestamp.
    Timestamp,
    /// Any [`Mixed`] value.
    Mixed,
    /// Link to an object in `target`.
    Link {
        /// Target table.
        target: TableKey,
        /// Whether deleting the last origin deletes the target.
        cascade: bool,
        /// Tag of the paired backlink column in the target table.
        backlink_tag: u32,
    },
    /// Reverse side of a link column; every row lists the origins that link
    /// to it.
    BackLink {
        /// Table holding the link column.
        origin_table: TableKey,
        /// Tag of the link column.
        origin_tag: u32,
        /// Copy of the link column's cascade flag.
        strong: bool,
    },
    /// Per-object dictionary of `Mixed` to `Mixed`.
    Dictionary,
}

/// How a column's values are laid out in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStorage {
    /// One [`Mixed`] per row.
    Values,
    /// One index per row into the column's enum keys (`-1` is null).
    Enum,
    /// One list of origin keys per row.
    BackLinks,
    /// Two child references per row: keys tree and values tree.
    Dictionary,
}

/// Description of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, unique within the table.
    pub name: String,
    /// Stable identity of the column.
    pub tag: u32,
    /// Column type.
    pub ty: ColumnType,
    /// Whether null is a legal value.
    pub nullable: bool,
    /// Deduplicated strings once the column has been enumerated.
    pub enum_keys: Option<Vec<String>>,
}

impl ColumnSpec {
    /// Creates a column description.
    pub fn new(name: impl Into<String>, tag: u32, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            tag,
            ty,
            nullable,
            enum_keys: None,
        }
    }

    /// Leaf layout for this column.
    #[must_use]
    pub fn storage(&self) -> ColumnStorage {
        match self.ty {
            ColumnType::BackLink { .. } => ColumnStorage::BackLinks,
            ColumnType::Dictionary => ColumnStorage::Dictionary,
            ColumnType::String if self.enum_keys.is_some() => ColumnStorage::Enum,
            _ => ColumnStorage::Values,
        }
    }

    /// Value a freshly inserted row holds.
    #[must_use]
    pub fn default_value(&self) -> Mixed {
        if self.nullable {
            return Mixed::Null;
        }
        match self.ty {
            ColumnType::Int => Mixed::Int(0),
            ColumnType::Bool => Mixed::Bool(false),
            ColumnType::Float => Mixed::Float(0.0),
            ColumnType::Double => Mixed::Double(0.0),
            ColumnType::String => Mixed::String(String::new()),
            ColumnType::Binary => Mixed::Binary(bytes::Bytes::new()),
            ColumnType::Timestamp => Mixed::Timestamp(Timestamp::new(0, 0)),
            _ => Mixed::Null,
        }
    }

    /// Checks that `value` may be stored in this column through a plain set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] for a value of the wrong kind or a
    /// null in a non-nullable column, and [`CoreError::InvalidColumn`] for
    /// columns that cannot be set directly.
    pub fn check_value(&self, value: &Mixed) -> CoreResult<()> {
        if value.is_null() {
            return match self.ty {
                ColumnType::Mixed | ColumnType::Link { .. } => Ok(()),
                _ if self.nullable => Ok(()),
                _ => Err(CoreError::type_mismatch(
                    format!("non-null {}", self.type_name()),
                    "null",
                )),
            };
        }
        let ok = match (&self.ty, value) {
            (ColumnType::Int, Mixed::Int(_))
            | (ColumnType::Bool, Mixed::Bool(_))
            | (ColumnType::Float, Mixed::Float(_))
            | (ColumnType::Double, Mixed::Double(_))
            | (ColumnType::String, Mixed::String(_))
            | (ColumnType::Binary, Mixed::Binary(_))
            | (ColumnType::Timestamp, Mixed::Timestamp(_))
            | (ColumnType::Link { .. }, Mixed::Link(_)) => true,
            (ColumnType::Mixed, v) => !matches!(v, Mixed::Link(_)),
            (ColumnType::BackLink { .. } | ColumnType::Dictionary, _) => {
                return Err(CoreError::invalid_column(format!(
                    "column '{}' cannot be set directly",
                    self.name
                )))
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::type_mismatch(self.type_name(), value.kind()))
        }
    }

    /// Human readable type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.ty {
            ColumnType::Int => "int",
            ColumnType::Bool => "bool",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::String => "string",
            ColumnType::Binary => "binary",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Mixed => "mixed",
            ColumnType::Link { .. } => "link",
            ColumnType::BackLink { .. } => "backlink",
            ColumnType::Dictionary => "dictionary",
        }
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name, unique within the group.
    pub name: String,
    /// Columns in leaf slot order.
    pub columns: Vec<ColumnSpec>,
    /// Next key handed out by `create_object`.
    pub next_key: i64,
    /// Next column tag.
    pub next_tag: u32,
}

impl TableSchema {
    /// Creates an empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            next_key: 0,
            next_tag: 1,
        }
    }

    /// Key of the column at `index`.
    #[must_use]
    pub fn col_key(&self, index: usize) -> Option<ColKey> {
        self.columns
            .get(index)
            .map(|c| ColKey::new(index as u32, c.tag))
    }

    /// Current position of the column with `tag`.
    #[must_use]
    pub fn position_of_tag(&self, tag: u32) -> Option<usize> {
        self.columns.iter().position(|c| c.tag == tag)
    }

    /// Resolves `col` to its current position.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidColumn`] if the column no longer exists.
    pub fn resolve(&self, col: ColKey) -> CoreResult<usize> {
        match self.columns.get(col.index()) {
            Some(spec) if spec.tag == col.tag => Ok(col.index()),
            _ => self.position_of_tag(col.tag).ok_or_else(|| {
                CoreError::invalid_column(format!("{col} not in table '{}'", self.name))
            }),
        }
    }

    /// Finds a column by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ColKey> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.col_key(i))
    }

    /// Allocates the next column tag.
    pub fn take_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
}
