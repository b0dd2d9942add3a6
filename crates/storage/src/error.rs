//! Storage error types.

use thiserror::Error;

/// Content store operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("store is not started: {0}")]
    NotStarted(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by a peer or the location tracker.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
