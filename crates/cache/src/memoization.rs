//! Memoization store traits and the location-database implementation.
//!
//! Records map a [`StrongFingerprint`] to a [`ContentHashListWithDeterminism`].
//! Compare-exchange is the only way a published record changes;
//! [`MemoizationSession::add_or_get_content_hash_list`] is built on it.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use quarry_core::{
    ContentHashListWithDeterminism, CounterSet, Fingerprint, Selector, StrongFingerprint,
};
use quarry_metadata::ContentLocationDatabase;
use quarry_storage::ContentSession;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Attempts before `add_or_get_content_hash_list` gives up on a contended key.
const MAX_ADD_OR_GET_ATTEMPTS: usize = 8;

/// Result of [`MemoizationSession::add_or_get_content_hash_list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOrGetOutcome {
    /// The offered value is now the published one.
    Added,
    /// An existing value won and is returned instead.
    Existing(ContentHashListWithDeterminism),
}

/// A memoization store with an explicit lifecycle.
#[async_trait]
pub trait MemoizationStore: Send + Sync + 'static {
    async fn startup(&self) -> CacheResult<()>;

    async fn shutdown(&self) -> CacheResult<()>;

    /// Open a session. `content` is the content session to consult for
    /// availability, when the cache is configured to pass it through.
    async fn create_session(
        &self,
        name: &str,
        content: Option<Arc<dyn ContentSession>>,
    ) -> CacheResult<Arc<dyn MemoizationSession>>;

    fn stats(&self) -> CounterSet;

    fn store_name(&self) -> &'static str;
}

/// Per-caller handle for memoization records.
#[async_trait]
pub trait MemoizationSession: Send + Sync {
    fn name(&self) -> &str;

    /// Selectors recorded under `weak`, most recently used first.
    async fn get_selectors(&self, weak: &Fingerprint) -> CacheResult<Vec<Selector>>;

    async fn get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
    ) -> CacheResult<Option<ContentHashListWithDeterminism>>;

    /// Replace the record only if it currently equals `expected`.
    async fn compare_exchange(
        &self,
        strong: &StrongFingerprint,
        expected: &ContentHashListWithDeterminism,
        replacement: &ContentHashListWithDeterminism,
    ) -> CacheResult<bool>;

    /// Publish `value` unless an existing record should win.
    async fn add_or_get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
        value: &ContentHashListWithDeterminism,
    ) -> CacheResult<AddOrGetOutcome>;

    fn enumerate_strong_fingerprints(
        &self,
        cancel: CancellationToken,
    ) -> BoxStream<'_, CacheResult<StrongFingerprint>>;
}

#[derive(Default)]
struct MemoizationCounters {
    sessions: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    compare_exchanges: AtomicU64,
    compare_exchange_applied: AtomicU64,
    add_or_get_added: AtomicU64,
    add_or_get_existing: AtomicU64,
    add_or_get_retries: AtomicU64,
}

struct StoreInner {
    database: Arc<ContentLocationDatabase>,
    started: AtomicBool,
    counters: MemoizationCounters,
}

/// Memoization store backed by a [`ContentLocationDatabase`].
pub struct DatabaseMemoizationStore {
    inner: Arc<StoreInner>,
}

impl DatabaseMemoizationStore {
    pub fn new(database: Arc<ContentLocationDatabase>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                database,
                started: AtomicBool::new(false),
                counters: MemoizationCounters::default(),
            }),
        }
    }

    pub fn database(&self) -> &Arc<ContentLocationDatabase> {
        &self.inner.database
    }
}

#[async_trait]
impl MemoizationStore for DatabaseMemoizationStore {
    async fn startup(&self) -> CacheResult<()> {
        self.inner.database.initialize().await?;
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn shutdown(&self) -> CacheResult<()> {
        self.inner.started.store(false, Ordering::Release);
        self.inner.database.flush().await?;
        Ok(())
    }

    async fn create_session(
        &self,
        name: &str,
        content: Option<Arc<dyn ContentSession>>,
    ) -> CacheResult<Arc<dyn MemoizationSession>> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(CacheError::NotStarted("database memoization store"));
        }
        self.inner.counters.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(DatabaseMemoizationSession {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
            content,
        }))
    }

    fn stats(&self) -> CounterSet {
        let c = &self.inner.counters;
        let mut stats = CounterSet::new();
        for (name, counter) in [
            ("sessions", &c.sessions),
            ("gets", &c.gets),
            ("hits", &c.hits),
            ("compare_exchanges", &c.compare_exchanges),
            ("compare_exchange_applied", &c.compare_exchange_applied),
            ("add_or_get_added", &c.add_or_get_added),
            ("add_or_get_existing", &c.add_or_get_existing),
            ("add_or_get_retries", &c.add_or_get_retries),
        ] {
            stats.set(name, counter.load(Ordering::Relaxed) as i64);
        }
        stats.merge_prefixed("database.", &self.inner.database.counters());
        stats
    }

    fn store_name(&self) -> &'static str {
        "database"
    }
}

/// Session over a [`DatabaseMemoizationStore`].
pub struct DatabaseMemoizationSession {
    name: String,
    inner: Arc<StoreInner>,
    content: Option<Arc<dyn ContentSession>>,
}

impl DatabaseMemoizationSession {
    /// Whether every hash the record lists is available. Without a content
    /// session there is nothing to check and the content counts as present.
    async fn content_available(&self, record: &ContentHashListWithDeterminism) -> CacheResult<bool> {
        let (Some(content), Some(list)) = (&self.content, &record.content_hash_list) else {
            return Ok(true);
        };
        for hash in &list.hashes {
            if !content.contains(hash).await? {
                debug!(hash = %hash, "content for existing record is missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `existing` should be returned instead of installing `incoming`.
    async fn existing_wins(
        &self,
        existing: &ContentHashListWithDeterminism,
        incoming: &ContentHashListWithDeterminism,
        now: OffsetDateTime,
    ) -> CacheResult<bool> {
        if existing
            .determinism
            .should_be_replaced_by(&incoming.determinism, now)
        {
            return Ok(false);
        }
        if existing.content_hash_list == incoming.content_hash_list {
            return Ok(true);
        }
        if existing.determinism.is_deterministic(now) {
            return Ok(true);
        }
        self.content_available(existing).await
    }
}

#[async_trait]
impl MemoizationSession for DatabaseMemoizationSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_selectors(&self, weak: &Fingerprint) -> CacheResult<Vec<Selector>> {
        Ok(self.inner.database.get_selectors(weak).await?)
    }

    async fn get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
    ) -> CacheResult<Option<ContentHashListWithDeterminism>> {
        let counters = &self.inner.counters;
        counters.gets.fetch_add(1, Ordering::Relaxed);
        let record = self.inner.database.get_content_hash_list(strong).await?;
        if record.is_some() {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(record)
    }

    async fn compare_exchange(
        &self,
        strong: &StrongFingerprint,
        expected: &ContentHashListWithDeterminism,
        replacement: &ContentHashListWithDeterminism,
    ) -> CacheResult<bool> {
        let counters = &self.inner.counters;
        counters.compare_exchanges.fetch_add(1, Ordering::Relaxed);
        let applied = self
            .inner
            .database
            .compare_exchange(strong, expected, replacement)
            .await?;
        if applied {
            counters.compare_exchange_applied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(applied)
    }

    #[instrument(skip_all, fields(strong = %strong, session = %self.name))]
    async fn add_or_get_content_hash_list(
        &self,
        strong: &StrongFingerprint,
        value: &ContentHashListWithDeterminism,
    ) -> CacheResult<AddOrGetOutcome> {
        let counters = &self.inner.counters;
        for attempt in 0..MAX_ADD_OR_GET_ATTEMPTS {
            if attempt > 0 {
                counters.add_or_get_retries.fetch_add(1, Ordering::Relaxed);
            }

            let existing = self
                .inner
                .database
                .get_content_hash_list(strong)
                .await?
                .unwrap_or_else(ContentHashListWithDeterminism::missing);

            if !existing.is_missing()
                && self
                    .existing_wins(&existing, value, OffsetDateTime::now_utc())
                    .await?
            {
                counters.add_or_get_existing.fetch_add(1, Ordering::Relaxed);
                return Ok(AddOrGetOutcome::Existing(existing));
            }

            if self.compare_exchange(strong, &existing, value).await? {
                counters.add_or_get_added.fetch_add(1, Ordering::Relaxed);
                return Ok(AddOrGetOutcome::Added);
            }
            debug!(attempt, "lost compare-exchange race, re-reading record");
        }
        Err(CacheError::Contended {
            attempts: MAX_ADD_OR_GET_ATTEMPTS,
        })
    }

    fn enumerate_strong_fingerprints(
        &self,
        cancel: CancellationToken,
    ) -> BoxStream<'_, CacheResult<StrongFingerprint>> {
        self.inner
            .database
            .enumerate_strong_fingerprints(cancel)
            .map(|item| item.map_err(CacheError::from))
            .boxed()
    }
}
