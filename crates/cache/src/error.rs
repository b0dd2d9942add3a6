//! Cache error types.

use quarry_metadata::MetadataError;
use quarry_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Which half of a composite session failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionHalf {
    Content,
    Memoization,
}

impl fmt::Display for SessionHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionHalf::Content => f.write_str("content"),
            SessionHalf::Memoization => f.write_str("memoization"),
        }
    }
}

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{operation} is not implemented by inner store {store}")]
    NotImplemented {
        operation: &'static str,
        store: &'static str,
    },

    /// Every failure of a composite startup or shutdown, in order.
    #[error("{}", .0.join("; "))]
    Aggregate(Vec<String>),

    #[error("failed to create {half} session: {message}")]
    Session { half: SessionHalf, message: String },

    #[error("{0} is not started")]
    NotStarted(&'static str),

    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    #[error("compare-exchange lost {attempts} races in a row")]
    Contended { attempts: usize },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl CacheError {
    /// The operation is not available in this configuration.
    pub fn is_unsupported(&self) -> bool {
        match self {
            CacheError::NotImplemented { .. } => true,
            CacheError::Metadata(e) => e.is_unsupported(),
            _ => false,
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
