//! The content location database: backend-agnostic orchestration over a
//! [`LocationBackend`].
//!
//! Adds what every backend shares: initialization gating, entry
//! (de)serialization, read-modify-write helpers, paged lazy enumeration,
//! write-back buffering, checkpoint I/O, cluster state sync and garbage
//! collection (see [`crate::gc`]).

use crate::cluster::ClusterState;
use crate::content_cache::{CacheLookup, ContentCache};
use crate::enumeration::EnumerationFilter;
use crate::error::{MetadataError, MetadataResult};
use crate::repos::EntryUpdate;
use crate::store::LocationBackend;
use futures::Stream;
use quarry_core::config::LocationStoreConfig;
use quarry_core::{
    CLUSTER_EPOCH_KEY, ContentHashListWithDeterminism, ContentLocationEntry, CounterSet,
    Fingerprint, MachineId, Selector, ShortHash, StrongFingerprint,
};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Lazily produced, ascending stream of keys.
pub type KeyStream<'a> = Pin<Box<dyn Stream<Item = MetadataResult<ShortHash>> + Send + 'a>>;

/// Lazily produced, ascending stream of entries with their keys.
pub type EntryStream<'a> =
    Pin<Box<dyn Stream<Item = MetadataResult<(ShortHash, ContentLocationEntry)>> + Send + 'a>>;

/// Lazily produced stream of memoization keys.
pub type StrongFingerprintStream<'a> =
    Pin<Box<dyn Stream<Item = MetadataResult<StrongFingerprint>> + Send + 'a>>;

#[derive(Default)]
struct DatabaseCounters {
    gets: AtomicU64,
    get_misses: AtomicU64,
    persists: AtomicU64,
    deletes: AtomicU64,
    gc_runs: AtomicU64,
    checkpoints_saved: AtomicU64,
    checkpoints_restored: AtomicU64,
}

/// Durable mapping `ShortHash -> ContentLocationEntry` plus memoization records.
pub struct ContentLocationDatabase {
    pub(crate) backend: Arc<dyn LocationBackend>,
    cache: Option<ContentCache>,
    pub(crate) config: LocationStoreConfig,
    initialized: OnceCell<()>,
    pub(crate) gc_running: AtomicBool,
    counters: DatabaseCounters,
}

impl ContentLocationDatabase {
    pub fn new(backend: Arc<dyn LocationBackend>, config: LocationStoreConfig) -> Self {
        let cache = config
            .content_cache
            .enabled
            .then(|| ContentCache::new(config.content_cache.clone()));
        Self {
            backend,
            cache,
            config,
            initialized: OnceCell::new(),
            gc_running: AtomicBool::new(false),
            counters: DatabaseCounters::default(),
        }
    }

    /// Prepare the backend. Idempotent; concurrent callers share one attempt.
    pub async fn initialize(&self) -> MetadataResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.backend.initialize().await?;
                info!(backend = self.backend.backend_name(), "location database initialized");
                Ok::<(), MetadataError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    pub(crate) fn ensure_initialized(&self) -> MetadataResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(MetadataError::NotInitialized)
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn config(&self) -> &LocationStoreConfig {
        &self.config
    }

    pub async fn health_check(&self) -> MetadataResult<()> {
        self.backend.health_check().await
    }

    /// Look up an entry. `Ok(None)` is the "no known location" outcome.
    ///
    /// The returned entry is a fresh snapshot with its last access time
    /// moved to now. The refresh is not persisted; use [`Self::touch`] for that.
    pub async fn try_get_entry(
        &self,
        hash: &ShortHash,
    ) -> MetadataResult<Option<ContentLocationEntry>> {
        self.ensure_initialized()?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        let bytes = match self.cache.as_ref().map(|c| c.get(hash)) {
            Some(CacheLookup::Hit(value)) => value,
            Some(CacheLookup::Miss) | None => self.backend.get_entry(hash).await?,
        };

        match bytes {
            Some(bytes) => Ok(Some(
                ContentLocationEntry::from_bytes(&bytes)?.touched(OffsetDateTime::now_utc()),
            )),
            None => {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Upsert an entry. The stored entry is replaced, not merged with what
    /// was there; concurrent writers to the same key race and the last one wins.
    pub async fn persist(&self, hash: &ShortHash, entry: &ContentLocationEntry) -> MetadataResult<()> {
        self.ensure_initialized()?;
        self.counters.persists.fetch_add(1, Ordering::Relaxed);
        let bytes = entry.to_bytes()?;
        self.write(*hash, Some(bytes)).await
    }

    pub async fn delete(&self, hash: &ShortHash) -> MetadataResult<()> {
        self.ensure_initialized()?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.write(*hash, None).await
    }

    async fn write(&self, hash: ShortHash, value: Option<Vec<u8>>) -> MetadataResult<()> {
        match &self.cache {
            Some(cache) => {
                cache.put(hash, value);
                if cache.should_flush() {
                    cache.flush(self.backend.as_ref()).await?;
                }
                Ok(())
            }
            None => match value {
                Some(bytes) => self.backend.put_entry(&hash, &bytes).await,
                None => self.backend.delete_entry(&hash).await,
            },
        }
    }

    /// Apply a set of updates, buffered or as one backend batch.
    pub(crate) async fn apply_updates(&self, updates: Vec<EntryUpdate>) -> MetadataResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        match &self.cache {
            Some(cache) => {
                for (hash, value) in updates {
                    cache.put(hash, value);
                }
                Ok(())
            }
            None => self.backend.write_batch(&updates).await,
        }
    }

    /// Record that `machine` holds the content. Read-modify-write over
    /// [`persist`](Self::persist), so it inherits last-writer-wins.
    pub async fn add_location(
        &self,
        hash: &ShortHash,
        machine: MachineId,
        content_size: i64,
    ) -> MetadataResult<ContentLocationEntry> {
        let now = OffsetDateTime::now_utc();
        let entry = match self.try_get_entry(hash).await? {
            Some(existing) => {
                let mut next = existing.with_location(machine, now);
                if next.content_size < 0 {
                    next.content_size = content_size;
                }
                next
            }
            None => ContentLocationEntry::new([machine], content_size, now),
        };
        self.persist(hash, &entry).await?;
        Ok(entry)
    }

    /// Drop `machine` from the entry's locations. Returns the updated entry,
    /// or `None` if there was no entry.
    pub async fn remove_location(
        &self,
        hash: &ShortHash,
        machine: MachineId,
    ) -> MetadataResult<Option<ContentLocationEntry>> {
        let Some(existing) = self.try_get_entry(hash).await? else {
            return Ok(None);
        };
        let entry = existing.without_location(machine, OffsetDateTime::now_utc());
        self.persist(hash, &entry).await?;
        Ok(Some(entry))
    }

    /// Refresh the entry's last access time.
    pub async fn touch(&self, hash: &ShortHash) -> MetadataResult<Option<ContentLocationEntry>> {
        let Some(existing) = self.try_get_entry(hash).await? else {
            return Ok(None);
        };
        let entry = existing.touched(OffsetDateTime::now_utc());
        self.persist(hash, &entry).await?;
        Ok(Some(entry))
    }

    /// All keys in ascending order, fetched page by page.
    pub fn enumerate_sorted_keys(&self, cancel: CancellationToken) -> KeyStream<'_> {
        let entries = self.enumerate_raw(cancel, EnumerationFilter::new());
        Box::pin(async_stream::try_stream! {
            for await item in entries {
                let (hash, _) = item?;
                yield hash;
            }
        })
    }

    /// Entries in ascending key order, starting at the filter's cursor and
    /// skipping entries its predicate rejects.
    pub fn enumerate_entries_with_sorted_keys(
        &self,
        cancel: CancellationToken,
        filter: Option<EnumerationFilter>,
    ) -> EntryStream<'_> {
        let entries = self.enumerate_raw(cancel, filter.unwrap_or_default());
        Box::pin(async_stream::try_stream! {
            for await item in entries {
                let (hash, bytes) = item?;
                yield (hash, ContentLocationEntry::from_bytes(&bytes)?);
            }
        })
    }

    fn enumerate_raw(
        &self,
        cancel: CancellationToken,
        filter: EnumerationFilter,
    ) -> Pin<Box<dyn Stream<Item = MetadataResult<(ShortHash, Vec<u8>)>> + Send + '_>> {
        let page_size = self.config.enumeration_page_size.max(1);
        Box::pin(async_stream::try_stream! {
            self.ensure_initialized()?;
            self.flush().await?;

            let mut cursor = Some(filter.start());
            while let Some(start) = cursor {
                if cancel.is_cancelled() {
                    Err::<(), _>(MetadataError::Cancelled)?;
                }
                let page = self.backend.scan_entries(&start, page_size).await?;
                cursor = if page.len() < page_size {
                    None
                } else {
                    page.last().and_then(|(hash, _)| hash.successor())
                };
                for (hash, bytes) in page {
                    if filter.should_enumerate(&bytes) {
                        yield (hash, bytes);
                    }
                }
            }
        })
    }

    /// Flush buffered writes. Returns the number of entries written.
    pub async fn flush(&self) -> MetadataResult<usize> {
        match &self.cache {
            Some(cache) => cache.flush(self.backend.as_ref()).await,
            None => Ok(0),
        }
    }

    /// Flush only if the update cap or the flushing interval says so.
    pub async fn flush_if_due(&self) -> MetadataResult<usize> {
        match &self.cache {
            Some(cache) if cache.should_flush() => cache.flush(self.backend.as_ref()).await,
            _ => Ok(0),
        }
    }

    #[instrument(skip(self), fields(backend = self.backend.backend_name()))]
    pub async fn save_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
        self.ensure_initialized()?;
        self.flush().await?;
        self.backend.save_checkpoint(directory).await?;
        self.counters
            .checkpoints_saved
            .fetch_add(1, Ordering::Relaxed);
        info!(directory = %directory.display(), "checkpoint saved");
        Ok(())
    }

    /// Replace the store contents with a checkpoint. Pending buffered writes
    /// are discarded.
    #[instrument(skip(self), fields(backend = self.backend.backend_name()))]
    pub async fn restore_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
        self.ensure_initialized()?;
        if let Some(cache) = &self.cache {
            let discarded = cache.clear();
            if discarded > 0 {
                warn!(discarded, "discarding buffered writes before checkpoint restore");
            }
        }
        self.backend.restore_checkpoint(directory).await?;
        self.counters
            .checkpoints_restored
            .fetch_add(1, Ordering::Relaxed);
        info!(directory = %directory.display(), "checkpoint restored");
        Ok(())
    }

    pub fn is_immutable(&self, path: &Path) -> bool {
        self.backend.is_immutable(path)
    }

    /// Sync cluster membership with the backend.
    ///
    /// With `write`, persist `cluster` (and its epoch). Otherwise hydrate
    /// `cluster` from persisted records, unless they belong to another epoch.
    pub async fn update_cluster_state(
        &self,
        cluster: &ClusterState,
        write: bool,
    ) -> MetadataResult<()> {
        self.ensure_initialized()?;
        if !self.config.store_cluster_state {
            debug!("cluster state persistence disabled");
            return Ok(());
        }

        if write {
            let machines = cluster.machines();
            self.backend.store_machines(&machines).await?;
            self.backend
                .set_global(CLUSTER_EPOCH_KEY, Some(cluster.epoch()))
                .await?;
            debug!(machines = machines.len(), epoch = cluster.epoch(), "cluster state persisted");
            return Ok(());
        }

        if let Some(stored) = self.backend.get_global(CLUSTER_EPOCH_KEY).await?
            && stored != cluster.epoch()
        {
            warn!(
                stored_epoch = %stored,
                current_epoch = cluster.epoch(),
                "persisted cluster state belongs to another epoch, not loading it"
            );
            return Ok(());
        }
        let records = self.backend.load_machines().await?;
        cluster.apply_records(&records);
        debug!(machines = records.len(), "cluster state loaded");
        Ok(())
    }

    pub async fn get_global_entry(&self, key: &str) -> MetadataResult<Option<String>> {
        self.ensure_initialized()?;
        self.backend.get_global(key).await
    }

    /// Set a global entry; `None` deletes it.
    pub async fn set_global_entry(&self, key: &str, value: Option<&str>) -> MetadataResult<()> {
        self.ensure_initialized()?;
        self.backend.set_global(key, value).await
    }

    pub async fn compare_exchange(
        &self,
        strong: &StrongFingerprint,
        expected: &ContentHashListWithDeterminism,
        replacement: &ContentHashListWithDeterminism,
    ) -> MetadataResult<bool> {
        self.ensure_initialized()?;
        self.backend
            .compare_exchange(strong, expected, replacement, OffsetDateTime::now_utc())
            .await
    }

    pub async fn get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
    ) -> MetadataResult<Option<ContentHashListWithDeterminism>> {
        self.ensure_initialized()?;
        self.backend
            .get_content_hash_list(strong, OffsetDateTime::now_utc())
            .await
    }

    pub async fn get_selectors(&self, weak: &Fingerprint) -> MetadataResult<Vec<Selector>> {
        self.ensure_initialized()?;
        self.backend.get_selectors(weak).await
    }

    pub fn enumerate_strong_fingerprints(
        &self,
        cancel: CancellationToken,
    ) -> StrongFingerprintStream<'_> {
        let page_size = self.config.enumeration_page_size.max(1);
        Box::pin(async_stream::try_stream! {
            self.ensure_initialized()?;
            let mut offset = 0u64;
            loop {
                if cancel.is_cancelled() {
                    Err::<(), _>(MetadataError::Cancelled)?;
                }
                let page = self.backend.scan_strong_fingerprints(offset, page_size).await?;
                let done = page.len() < page_size;
                offset += page.len() as u64;
                for strong in page {
                    yield strong;
                }
                if done {
                    break;
                }
            }
        })
    }

    pub(crate) fn record_gc_run(&self) {
        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> CounterSet {
        let mut set = CounterSet::new();
        let c = &self.counters;
        set.set("gets", c.gets.load(Ordering::Relaxed) as i64);
        set.set("get_misses", c.get_misses.load(Ordering::Relaxed) as i64);
        set.set("persists", c.persists.load(Ordering::Relaxed) as i64);
        set.set("deletes", c.deletes.load(Ordering::Relaxed) as i64);
        set.set("gc_runs", c.gc_runs.load(Ordering::Relaxed) as i64);
        set.set(
            "checkpoints_saved",
            c.checkpoints_saved.load(Ordering::Relaxed) as i64,
        );
        set.set(
            "checkpoints_restored",
            c.checkpoints_restored.load(Ordering::Relaxed) as i64,
        );
        if let Some(cache) = &self.cache {
            set.set("cache_pending", cache.pending() as i64);
            set.set("cache_flushes", cache.flush_count() as i64);
            set.set("cache_flushed_entries", cache.flushed_entries() as i64);
        }
        set
    }
}
