//! Error types for Arbor core.

use crate::types::{ObjKey, TableKey};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Arbor core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] arbor_storage::StorageError),

    /// A node record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// An object key is not present.
    #[error("key not found: {key}")]
    KeyNotFound {
        /// The missing key.
        key: ObjKey,
    },

    /// A dictionary key is not present.
    #[error("dictionary key not found: {key}")]
    DictionaryKeyNotFound {
        /// Rendering of the missing key.
        key: String,
    },

    /// A positional access was past the end.
    #[error("index {index} out of range (size {size})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Size of the container.
        size: usize,
    },

    /// An object with this key already exists.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// The conflicting key.
        key: ObjKey,
    },

    /// Mutation attempted through a read-only snapshot.
    #[error("mutation through a read-only snapshot")]
    ReadOnly,

    /// The transaction owning an accessor has committed or rolled back.
    #[error("transaction has ended")]
    TransactionEnded,

    /// Table key does not name a table.
    #[error("table not found: {table}")]
    TableNotFound {
        /// The table key or name.
        table: String,
    },

    /// Column key is stale or of the wrong table.
    #[error("invalid column: {message}")]
    InvalidColumn {
        /// Description of the problem.
        message: String,
    },

    /// Value kind does not match the column type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected kind.
        expected: String,
        /// Actual kind.
        actual: String,
    },

    /// A structural invariant does not hold. Fatal: the current write
    /// transaction must be rolled back.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid column error.
    pub fn invalid_column(message: impl Into<String>) -> Self {
        Self::InvalidColumn {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a table not found error.
    pub fn table_not_found(table: TableKey) -> Self {
        Self::TableNotFound {
            table: table.to_string(),
        }
    }

    /// Whether the error signals corruption rather than a caller mistake.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Codec { .. })
    }

    /// Whether the error is a recoverable "not found" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound { .. }
                | Self::DictionaryKeyNotFound { .. }
                | Self::IndexOutOfRange { .. }
        )
    }
}
