//! Copy protocol error types.

use quarry_metadata::MetadataError;
use quarry_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Why a copy operation failed, for deciding whether to retry elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyFailureReason {
    /// The content address could not be parsed. Not retried.
    SourcePathMalformed,
    /// The peer could not be reached, or no client could be acquired for it.
    SourceUnreachable,
    /// The peer does not hold the content.
    ContentNotFound,
    /// The transfer started but did not complete correctly.
    TransferError,
    TimedOut,
    Cancelled,
}

/// Copy protocol errors.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("malformed content address {path:?}: {message}")]
    SourcePathMalformed { path: String, message: String },

    #[error("peer {host} unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("client pool exhausted ({capacity} clients in use)")]
    PoolExhausted { capacity: usize },

    #[error("content not found on peer: {0}")]
    ContentNotFound(String),

    #[error("peer rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("size mismatch: expected {expected} bytes, copied {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl CopyError {
    pub fn malformed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourcePathMalformed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn reason(&self) -> CopyFailureReason {
        match self {
            CopyError::SourcePathMalformed { .. } => CopyFailureReason::SourcePathMalformed,
            CopyError::Unreachable { .. } | CopyError::PoolExhausted { .. } => {
                CopyFailureReason::SourceUnreachable
            }
            CopyError::ContentNotFound(_) => CopyFailureReason::ContentNotFound,
            CopyError::TimedOut(_) => CopyFailureReason::TimedOut,
            CopyError::Cancelled => CopyFailureReason::Cancelled,
            CopyError::Rejected { .. }
            | CopyError::Transfer(_)
            | CopyError::SizeMismatch { .. }
            | CopyError::Storage(_)
            | CopyError::Metadata(_) => CopyFailureReason::TransferError,
        }
    }

    /// A local configuration or addressing bug rather than a network problem.
    pub fn is_local(&self) -> bool {
        matches!(self, CopyError::SourcePathMalformed { .. })
    }

    /// Worth retrying against another location.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.reason(),
            CopyFailureReason::SourcePathMalformed | CopyFailureReason::Cancelled
        )
    }

    pub(crate) fn from_reqwest(host: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CopyError::Transfer(format!("request to {host} timed out: {err}"))
        } else if err.is_connect() {
            CopyError::Unreachable {
                host: host.to_string(),
                message: err.to_string(),
            }
        } else {
            CopyError::Transfer(err.to_string())
        }
    }
}

impl From<CopyError> for StorageError {
    fn from(err: CopyError) -> Self {
        match err {
            CopyError::Storage(inner) => inner,
            other => StorageError::Remote(other.to_string()),
        }
    }
}

/// Result type for copy operations.
pub type CopyResult<T> = std::result::Result<T, CopyError>;
