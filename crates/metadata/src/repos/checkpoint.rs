//! Bulk snapshot repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait CheckpointRepo: Send + Sync {
    /// Write a full snapshot into `directory`. Either the snapshot is
    /// published completely or the directory is left as it was.
    async fn save_checkpoint(&self, directory: &Path) -> MetadataResult<()>;

    /// Replace the store contents with the snapshot in `directory`, atomically.
    async fn restore_checkpoint(&self, directory: &Path) -> MetadataResult<()>;

    /// Whether a checkpoint file may be hard-linked or shared instead of copied.
    fn is_immutable(&self, path: &Path) -> bool;
}
