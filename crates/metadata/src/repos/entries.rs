//! Content location entry repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use quarry_core::ShortHash;

/// A pending write: `Some(bytes)` upserts, `None` deletes.
pub type EntryUpdate = (ShortHash, Option<Vec<u8>>);

/// Raw storage of serialized location entries keyed by short hash.
///
/// Values are opaque bytes at this layer so enumeration filters can run on
/// the serialized form without decoding.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Get the serialized entry for a key.
    async fn get_entry(&self, hash: &ShortHash) -> MetadataResult<Option<Vec<u8>>>;

    /// Upsert a serialized entry. Last writer wins.
    async fn put_entry(&self, hash: &ShortHash, value: &[u8]) -> MetadataResult<()>;

    async fn delete_entry(&self, hash: &ShortHash) -> MetadataResult<()>;

    /// Apply a batch of updates atomically.
    async fn write_batch(&self, batch: &[EntryUpdate]) -> MetadataResult<()>;

    /// Up to `limit` entries with keys `>= start`, in ascending key order.
    async fn scan_entries(
        &self,
        start: &ShortHash,
        limit: usize,
    ) -> MetadataResult<Vec<(ShortHash, Vec<u8>)>>;

    async fn count_entries(&self) -> MetadataResult<u64>;
}
