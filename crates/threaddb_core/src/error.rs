//! Error types for ThreadDB core.

use crate::schema::ValidationIssue;
use thiserror::Error;
use threaddb_storage::StorageError;
use threaddb_sync_protocol::ProtocolError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ThreadDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No remote service host is configured.
    #[error("no remote service host configured")]
    NoRemote,

    /// The thread id is missing or invalid.
    #[error("thread id error: {message}")]
    ThreadId {
        /// What went wrong.
        message: String,
    },

    /// A document with this id already exists.
    #[error("document {id} already exists in {collection}")]
    AlreadyExists {
        /// Collection name.
        collection: String,
        /// Conflicting id.
        id: String,
    },

    /// A document failed schema validation.
    #[error("validation failed for {collection}: {}", format_issues(.issues))]
    Validation {
        /// Collection name.
        collection: String,
        /// Every problem found.
        issues: Vec<ValidationIssue>,
    },

    /// Pushed changes and removed change records disagree.
    #[error("change processing error: {message}")]
    Change {
        /// Description of the mismatch.
        message: String,
    },

    /// A pull was attempted while local changes are pending.
    #[error("cannot pull with {pending} unpushed local changes")]
    LocalChanges {
        /// Number of pending change records.
        pending: usize,
    },

    /// The remote service reported an error.
    #[error("remote error: {0}")]
    Remote(#[from] ProtocolError),

    /// The requested version conflicts with the stored one.
    #[error("version error: requested {requested}, stored {stored}: {message}")]
    Version {
        /// Version passed to open.
        requested: u64,
        /// Version already persisted.
        stored: u64,
        /// Why the version was rejected.
        message: String,
    },

    /// A write transaction was requested inside a read transaction.
    #[error("cannot open a write transaction inside a read transaction")]
    TransactionMode,

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The database has not been opened yet.
    #[error("database is not open")]
    DatabaseNotOpen,

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// A lock could not be acquired in time.
    #[error("timed out acquiring lock on {key}")]
    LockTimeout {
        /// Lock path.
        key: String,
    },

    /// A lock outside the semaphore's prefix was requested.
    #[error("lock key {key} is outside prefix {prefix}")]
    LockScope {
        /// Requested key.
        key: String,
        /// Configured prefix.
        prefix: String,
    },

    /// A JSON patch could not be applied.
    #[error("patch error: {message}")]
    Patch {
        /// Description of the failure.
        message: String,
    },

    /// A query could not be compiled.
    #[error("query error: {message}")]
    Query {
        /// Description of the failure.
        message: String,
    },

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Public key authorization needs a signing callback.
    #[error("public key authorization requires a signing callback")]
    NoCallback,
}

impl CoreError {
    /// Creates a thread id error.
    pub fn thread_id(message: impl Into<String>) -> Self {
        Self::ThreadId {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(collection: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::Validation {
            collection: collection.into(),
            issues,
        }
    }

    /// Creates a change processing error.
    pub fn change(message: impl Into<String>) -> Self {
        Self::Change {
            message: message.into(),
        }
    }

    /// Creates a patch error.
    pub fn patch(message: impl Into<String>) -> Self {
        Self::Patch {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Returns true if retrying the operation may succeed. Only remote
    /// transport failures qualify; nothing in this crate retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_retryable())
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_transport() {
        assert!(CoreError::Remote(ProtocolError::transport("reset")).is_retryable());
        assert!(!CoreError::Remote(ProtocolError::AlreadyExists("t".into())).is_retryable());
        assert!(!CoreError::NoRemote.is_retryable());
    }

    #[test]
    fn validation_message_lists_issues() {
        let err = CoreError::validation(
            "people",
            vec![
                ValidationIssue::new("/age", "is required"),
                ValidationIssue::new("/name", "must be string"),
            ],
        );
        assert_eq!(
            err.to_string(),
            "validation failed for people: /age: is required; /name: must be string"
        );
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = StorageError::Closed.into();
        assert!(matches!(err, CoreError::Storage(StorageError::Closed)));
    }
}
