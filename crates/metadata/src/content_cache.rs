//! Write-back buffer in front of the location store backend.

use crate::error::MetadataResult;
use crate::repos::EntryUpdate;
use crate::store::LocationBackend;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use quarry_core::ShortHash;
use quarry_core::config::ContentCacheConfig;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Result of looking a key up in the write-back buffer.
pub(crate) enum CacheLookup {
    /// Buffered value; `None` is a pending delete.
    Hit(Option<Vec<u8>>),
    Miss,
}

/// Buffers entry writes in memory and flushes them to the backend in batches.
///
/// Reads check, in order: pending writes, the batch currently being flushed,
/// then entries preserved from the last flush.
pub(crate) struct ContentCache {
    config: ContentCacheConfig,
    dirty: DashMap<ShortHash, Option<Vec<u8>>>,
    flushing: DashMap<ShortHash, Option<Vec<u8>>>,
    clean: DashMap<ShortHash, Vec<u8>>,
    flush_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Instant>,
    flushes: AtomicU64,
    flushed_entries: AtomicU64,
}

impl ContentCache {
    pub(crate) fn new(config: ContentCacheConfig) -> Self {
        Self {
            config,
            dirty: DashMap::new(),
            flushing: DashMap::new(),
            clean: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            flushes: AtomicU64::new(0),
            flushed_entries: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self, hash: &ShortHash) -> CacheLookup {
        if let Some(value) = self.dirty.get(hash) {
            return CacheLookup::Hit(value.value().clone());
        }
        if let Some(value) = self.flushing.get(hash) {
            return CacheLookup::Hit(value.value().clone());
        }
        if let Some(value) = self.clean.get(hash) {
            return CacheLookup::Hit(Some(value.value().clone()));
        }
        CacheLookup::Miss
    }

    pub(crate) fn put(&self, hash: ShortHash, value: Option<Vec<u8>>) {
        self.dirty.insert(hash, value);
        self.clean.remove(&hash);
    }

    pub(crate) fn pending(&self) -> usize {
        self.dirty.len()
    }

    /// True when the update cap is reached or pending updates are older than
    /// the flushing interval.
    pub(crate) fn should_flush(&self) -> bool {
        let pending = self.dirty.len();
        if pending >= self.config.cache_maximum_updates_per_flush {
            return true;
        }
        pending > 0 && self.last_flush_elapsed() >= self.config.flushing_maximum_interval()
    }

    fn last_flush_elapsed(&self) -> std::time::Duration {
        self.last_flush
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn mark_flushed(&self) {
        *self.last_flush.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Drop everything buffered. Used when the backend is replaced wholesale.
    pub(crate) fn clear(&self) -> usize {
        let discarded = self.dirty.len();
        self.dirty.clear();
        self.flushing.clear();
        self.clean.clear();
        discarded
    }

    pub(crate) fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn flushed_entries(&self) -> u64 {
        self.flushed_entries.load(Ordering::Relaxed)
    }

    /// Write all pending updates to `backend`. Returns the number written.
    pub(crate) async fn flush(&self, backend: &dyn LocationBackend) -> MetadataResult<usize> {
        let _guard = self.flush_lock.lock().await;

        let keys: Vec<ShortHash> = self.dirty.iter().map(|e| *e.key()).collect();
        let mut batch: Vec<EntryUpdate> = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self.dirty.get(&key).map(|v| v.value().clone()) else {
                continue;
            };
            self.flushing.insert(key, value.clone());
            // A newer write stays pending for the next flush.
            self.dirty.remove_if(&key, |_, current| *current == value);
            batch.push((key, value));
        }

        if batch.is_empty() {
            self.mark_flushed();
            return Ok(0);
        }
        batch.sort_by_key(|(key, _)| *key);

        let result = if self.config.flush_single_transaction {
            backend.write_batch(&batch).await
        } else {
            let writes: Vec<_> = batch
                .chunks(self.config.flush_transaction_size)
                .map(|chunk| backend.write_batch(chunk))
                .collect();
            futures::stream::iter(writes)
                .buffer_unordered(self.config.flush_degree_of_parallelism)
                .try_collect::<Vec<()>>()
                .await
                .map(|_| ())
        };

        if let Err(e) = result {
            warn!(error = %e, entries = batch.len(), "write-back flush failed, keeping updates pending");
            for (key, value) in batch {
                self.dirty.entry(key).or_insert(value);
            }
            self.flushing.clear();
            return Err(e);
        }

        self.clean.clear();
        let preserve = batch.len() * usize::from(self.config.flush_preserve_percent_in_memory) / 100;
        for (key, value) in batch.iter().take(preserve) {
            if let Some(value) = value {
                self.clean.insert(*key, value.clone());
            }
        }
        self.flushing.clear();
        self.mark_flushed();

        let written = batch.len();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_entries
            .fetch_add(written as u64, Ordering::Relaxed);
        debug!(entries = written, preserved = preserve, "write-back flush complete");
        Ok(written)
    }
}
