//! In-memory location store backend.
//!
//! Holds location entries, global entries and cluster membership for tests
//! and ephemeral deployments. Memoization records are not supported here and
//! every memoization call reports [`MetadataError::Unsupported`].

use crate::cluster::MachineRecord;
use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    CheckpointRepo, ClusterRepo, EntryRepo, EntryUpdate, GlobalRepo, MemoizationRepo,
};
use crate::store::LocationBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use quarry_core::{
    ContentHashListWithDeterminism, Fingerprint, Selector, ShortHash, StrongFingerprint,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use time::OffsetDateTime;
use tracing::debug;

const BACKEND: &str = "memory";

/// In-memory backend. State lives and dies with the instance.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<ShortHash, Vec<u8>>>,
    globals: DashMap<String, String>,
    machines: RwLock<Vec<MachineRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported<T>(operation: &'static str) -> MetadataResult<T> {
        Err(MetadataError::Unsupported {
            operation,
            backend: BACKEND,
        })
    }
}

#[async_trait]
impl LocationBackend for MemoryStore {
    async fn initialize(&self) -> MetadataResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[async_trait]
impl EntryRepo for MemoryStore {
    async fn get_entry(&self, hash: &ShortHash) -> MetadataResult<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(hash).cloned())
    }

    async fn put_entry(&self, hash: &ShortHash, value: &[u8]) -> MetadataResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(*hash, value.to_vec());
        Ok(())
    }

    async fn delete_entry(&self, hash: &ShortHash) -> MetadataResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(hash);
        Ok(())
    }

    async fn write_batch(&self, batch: &[EntryUpdate]) -> MetadataResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (hash, value) in batch {
            match value {
                Some(value) => {
                    entries.insert(*hash, value.clone());
                }
                None => {
                    entries.remove(hash);
                }
            }
        }
        Ok(())
    }

    async fn scan_entries(
        &self,
        start: &ShortHash,
        limit: usize,
    ) -> MetadataResult<Vec<(ShortHash, Vec<u8>)>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(*start..)
            .take(limit)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    async fn count_entries(&self) -> MetadataResult<u64> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.len() as u64)
    }
}

#[async_trait]
impl MemoizationRepo for MemoryStore {
    async fn compare_exchange(
        &self,
        _strong: &StrongFingerprint,
        _expected: &ContentHashListWithDeterminism,
        _replacement: &ContentHashListWithDeterminism,
        _now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        Self::unsupported("compare_exchange")
    }

    async fn get_content_hash_list(
        &self,
        _strong: &StrongFingerprint,
        _now: OffsetDateTime,
    ) -> MetadataResult<Option<ContentHashListWithDeterminism>> {
        Self::unsupported("get_content_hash_list")
    }

    async fn get_selectors(&self, _weak: &Fingerprint) -> MetadataResult<Vec<Selector>> {
        Self::unsupported("get_selectors")
    }

    async fn scan_strong_fingerprints(
        &self,
        _offset: u64,
        _limit: usize,
    ) -> MetadataResult<Vec<StrongFingerprint>> {
        Self::unsupported("enumerate_strong_fingerprints")
    }

    async fn count_records(&self) -> MetadataResult<u64> {
        Self::unsupported("count_records")
    }

    async fn delete_least_recently_used(
        &self,
        _keep: u64,
        _protect_after: OffsetDateTime,
    ) -> MetadataResult<u64> {
        Self::unsupported("garbage_collect_metadata")
    }
}

#[async_trait]
impl GlobalRepo for MemoryStore {
    async fn get_global(&self, key: &str) -> MetadataResult<Option<String>> {
        Ok(self.globals.get(key).map(|v| v.value().clone()))
    }

    async fn set_global(&self, key: &str, value: Option<&str>) -> MetadataResult<()> {
        match value {
            Some(value) => {
                self.globals.insert(key.to_string(), value.to_string());
            }
            None => {
                self.globals.remove(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterRepo for MemoryStore {
    async fn load_machines(&self) -> MetadataResult<Vec<MachineRecord>> {
        Ok(self
            .machines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn store_machines(&self, machines: &[MachineRecord]) -> MetadataResult<()> {
        *self.machines.write().unwrap_or_else(|e| e.into_inner()) = machines.to_vec();
        Ok(())
    }
}

#[async_trait]
impl CheckpointRepo for MemoryStore {
    async fn save_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
        debug!(directory = %directory.display(), "memory backend skips checkpoint save");
        Ok(())
    }

    async fn restore_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
        debug!(directory = %directory.display(), "memory backend skips checkpoint restore");
        Ok(())
    }

    fn is_immutable(&self, _path: &Path) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ContentHash;

    fn key(seed: &[u8]) -> ShortHash {
        ContentHash::compute_sha256(seed).to_short_hash()
    }

    #[tokio::test]
    async fn test_scan_is_sorted_and_bounded() {
        let store = MemoryStore::new();
        for i in 0u8..10 {
            store.put_entry(&key(&[i]), &[i]).await.unwrap();
        }
        let page = store.scan_entries(&ShortHash::MIN, 4).await.unwrap();
        assert_eq!(page.len(), 4);
        assert!(page.windows(2).all(|w| w[0].0 < w[1].0));

        let rest = store
            .scan_entries(&page[3].0.successor().unwrap(), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 6);
        assert!(rest[0].0 > page[3].0);
    }

    #[tokio::test]
    async fn test_memoization_is_unsupported() {
        let store = MemoryStore::new();
        let err = store
            .get_selectors(&Fingerprint::new(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_global_none_deletes() {
        let store = MemoryStore::new();
        store.set_global("k", Some("v")).await.unwrap();
        assert_eq!(store.get_global("k").await.unwrap().as_deref(), Some("v"));
        store.set_global("k", None).await.unwrap();
        assert_eq!(store.get_global("k").await.unwrap(), None);
    }
}
