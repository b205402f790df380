//! Error types for remote thread-store calls.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors reported by a thread-store client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A database already exists for the thread.
    #[error("db already exists for thread {0}")]
    AlreadyExists(String),

    /// The collection is already registered on the thread.
    #[error("collection {0} already registered")]
    CollectionAlreadyRegistered(String),

    /// A document with this id already exists remotely.
    #[error("instance {id} already exists in {collection}")]
    InstanceExists {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },

    /// The thread, collection or document was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call was not authorized.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A thread id could not be parsed.
    #[error("invalid thread id: {0}")]
    InvalidThreadId(String),

    /// The transaction was used after it ended.
    #[error("transaction already finished")]
    TransactionFinished,

    /// A network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the call may succeed if retried.
        retryable: bool,
    },

    /// The server rejected the request.
    #[error("server error: {0}")]
    Server(String),
}

impl ProtocolError {
    /// Creates a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Returns true if retrying the call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ProtocolError::transport("reset").is_retryable());
        assert!(!ProtocolError::Transport {
            message: "tls".into(),
            retryable: false
        }
        .is_retryable());
        assert!(!ProtocolError::AlreadyExists("t".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ProtocolError::InstanceExists {
            collection: "people".into(),
            id: "a".into(),
        };
        assert_eq!(err.to_string(), "instance a already exists in people");
    }
}
