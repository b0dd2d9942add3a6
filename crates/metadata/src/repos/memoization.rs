//! Memoization record repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use quarry_core::{ContentHashListWithDeterminism, Fingerprint, Selector, StrongFingerprint};
use time::OffsetDateTime;

/// Strong-fingerprint keyed content hash list records.
///
/// Backends that cannot hold memoization records return
/// [`MetadataError::Unsupported`](crate::MetadataError::Unsupported) from
/// every method instead of pretending to be empty.
#[async_trait]
pub trait MemoizationRepo: Send + Sync {
    /// Replace the record for `strong` with `replacement` only if the stored
    /// content hash list equals `expected`'s (absence matches a missing
    /// `expected`). Returns whether the replacement was applied.
    async fn compare_exchange(
        &self,
        strong: &StrongFingerprint,
        expected: &ContentHashListWithDeterminism,
        replacement: &ContentHashListWithDeterminism,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Fetch a record and bump its access time.
    async fn get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ContentHashListWithDeterminism>>;

    /// Selectors recorded under a weak fingerprint, most recently used first.
    async fn get_selectors(&self, weak: &Fingerprint) -> MetadataResult<Vec<Selector>>;

    /// A page of strong fingerprints in a stable order.
    async fn scan_strong_fingerprints(
        &self,
        offset: u64,
        limit: usize,
    ) -> MetadataResult<Vec<StrongFingerprint>>;

    async fn count_records(&self) -> MetadataResult<u64>;

    /// Delete all but the `keep` most recently used records, sparing anything
    /// accessed at or after `protect_after`. Returns the number removed.
    async fn delete_least_recently_used(
        &self,
        keep: u64,
        protect_after: OffsetDateTime,
    ) -> MetadataResult<u64>;
}
