//! Local content storage for quarry.
//!
//! This crate provides:
//! - The [`ContentStore`] / [`ContentSession`] lifecycle and session traits
//! - Optional capabilities (streaming, push, copy requests, repair) exposed
//!   through [`ContentCapabilities`]
//! - A filesystem backend with atomic, hash-verified writes

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::{FilesystemContentStore, FilesystemSession};
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, ContentCapabilities, ContentSession, ContentStore, CopyRequestHandler,
    CopyRequestOutcome, PushDecision, PushFileHandler, PutResult, RepairStore, StreamStore,
};

use quarry_core::config::StorageConfig;

/// Create the local content store from configuration. The store still needs
/// `startup` before use.
pub fn from_config(config: &StorageConfig) -> StorageResult<FilesystemContentStore> {
    if config.root.as_os_str().is_empty() {
        return Err(StorageError::Config("storage root must not be empty".to_string()));
    }
    Ok(FilesystemContentStore::new(&config.root))
}
