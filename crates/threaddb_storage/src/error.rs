//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The commit log is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A record could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The engine is closed.
    #[error("storage is closed")]
    Closed,

    /// Another process holds the storage file lock.
    #[error("storage locked: another process has exclusive access")]
    Locked,

    /// The named table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The named table already exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// The table was not declared in the transaction scope.
    #[error("table {table} is not part of this transaction")]
    NotInScope {
        /// Table that was accessed.
        table: String,
    },

    /// A write was attempted in a read-only transaction.
    #[error("cannot write to {table} in a read-only transaction")]
    ReadOnly {
        /// Table that was written.
        table: String,
    },

    /// An `add` targeted a key that is already present.
    #[error("key {key} already exists in {table}")]
    KeyExists {
        /// Table name.
        table: String,
        /// Conflicting key.
        key: String,
    },

    /// The document does not carry the table's primary key.
    #[error("document for {table} is missing primary key field {path}")]
    MissingKey {
        /// Table name.
        table: String,
        /// Key path that was expected.
        path: String,
    },

    /// A unique index already maps the value to another key.
    #[error("unique index {index} on {table} already contains the value held by {key}")]
    ConstraintViolation {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
        /// Key currently holding the value.
        key: String,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Returns true if this error only affects a single row and leaves the
    /// transaction usable.
    pub fn is_row_error(&self) -> bool {
        matches!(
            self,
            StorageError::KeyExists { .. }
                | StorageError::MissingKey { .. }
                | StorageError::ConstraintViolation { .. }
        )
    }
}
