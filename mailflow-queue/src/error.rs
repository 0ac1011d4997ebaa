//! Error types for the mailflow-queue crate.
//!
//! Transient storage failures (`Io`) are kept apart from records that can
//! never be read back (`Corrupt`, `Serialization`), and from the
//! cancellation signal `dequeue` returns once the queue is closed.

use std::io;

use mailflow_common::MailId;
use thiserror::Error;

use crate::types::RecordKey;

/// Top-level queue error type.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Durable read/write/delete failed. Never retried by the queue itself.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A persisted record exists but cannot be turned back into a mail.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: RecordKey, reason: String },

    /// Mail not tracked by the queue.
    #[error("Mail not found: {0}")]
    NotFound(MailId),

    /// Queue storage validation failed.
    #[error("Queue validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The queue has been shut down.
    #[error("Queue is closed")]
    Closed,

    /// Internal error (capacity exhausted, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Transient failures may succeed if the caller tries again later
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Queue directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Queue path cannot contain '..' components: {0}")]
    ParentComponent(String),

    #[error("Queue path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Queue path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Queue path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let queue_err: QueueError = io_err.into();
        assert!(matches!(queue_err, QueueError::Io(_)));
        assert!(queue_err.is_transient());
    }

    #[test]
    fn test_error_classification() {
        assert!(QueueError::Closed.is_closed());
        assert!(!QueueError::Closed.is_transient());
        assert!(!QueueError::Internal("x".to_string()).is_transient());
    }

    #[test]
    fn test_error_chain() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let queue_err = QueueError::from(io_err);
        assert!(queue_err.to_string().contains("access denied"));
    }
}
