//! Two-level cache: one content store and one memoization store behind a
//! single lifecycle.

use crate::error::{CacheError, CacheResult, SessionHalf};
use crate::memoization::{MemoizationSession, MemoizationStore};
use quarry_core::config::CacheConfig;
use quarry_core::{ContentHash, CounterSet, MachineLocation};
use quarry_storage::{
    ByteStream, ContentCapabilities, ContentSession, ContentStore, CopyRequestOutcome,
    PushDecision,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Where the cache is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Starting,
    Started,
    /// Startup failed; both halves have been shut down.
    StartupFailed,
    ShuttingDown,
    ShutDown,
}

/// A content session and a memoization session created as one unit.
#[derive(Clone)]
pub struct CacheSession {
    name: String,
    content: Arc<dyn ContentSession>,
    memoization: Arc<dyn MemoizationSession>,
}

impl fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CacheSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &Arc<dyn ContentSession> {
        &self.content
    }

    pub fn memoization(&self) -> &Arc<dyn MemoizationSession> {
        &self.memoization
    }
}

/// Composes a content store and a memoization store.
pub struct TwoLevelCache {
    content: Arc<dyn ContentStore>,
    memoization: Arc<dyn MemoizationStore>,
    config: CacheConfig,
    capabilities: ContentCapabilities,
    startup_started: AtomicBool,
    startup_completed: AtomicBool,
    startup_failed: AtomicBool,
    shutdown_started: AtomicBool,
    shutdown_completed: AtomicBool,
    final_stats: Mutex<Option<CounterSet>>,
}

impl TwoLevelCache {
    pub fn new(
        content: Arc<dyn ContentStore>,
        memoization: Arc<dyn MemoizationStore>,
        config: CacheConfig,
    ) -> Self {
        let capabilities = content.capabilities();
        Self {
            content,
            memoization,
            config,
            capabilities,
            startup_started: AtomicBool::new(false),
            startup_completed: AtomicBool::new(false),
            startup_failed: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            shutdown_completed: AtomicBool::new(false),
            final_stats: Mutex::new(None),
        }
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn memoization_store(&self) -> &Arc<dyn MemoizationStore> {
        &self.memoization
    }

    /// Capabilities of the content store, resolved at construction.
    pub fn capabilities(&self) -> &ContentCapabilities {
        &self.capabilities
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.shutdown_completed.load(Ordering::Acquire) {
            Lifecycle::ShutDown
        } else if self.shutdown_started.load(Ordering::Acquire) {
            Lifecycle::ShuttingDown
        } else if self.startup_failed.load(Ordering::Acquire) {
            Lifecycle::StartupFailed
        } else if self.startup_completed.load(Ordering::Acquire) {
            Lifecycle::Started
        } else if self.startup_started.load(Ordering::Acquire) {
            Lifecycle::Starting
        } else {
            Lifecycle::NotStarted
        }
    }

    /// Start both stores concurrently.
    ///
    /// If one half fails, the half that started is shut down before the
    /// error is returned, and the error lists every failure.
    pub async fn startup(&self) -> CacheResult<()> {
        if self.startup_started.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Lifecycle("startup was already attempted".to_string()));
        }

        let (content, memoization) = tokio::join!(self.content.startup(), self.memoization.startup());

        let mut failures = Vec::new();
        match (content, memoization) {
            (Ok(()), Ok(())) => {
                self.startup_completed.store(true, Ordering::Release);
                info!(
                    content = self.content.store_name(),
                    memoization = self.memoization.store_name(),
                    "two-level cache started"
                );
                return Ok(());
            }
            (Err(c), Ok(())) => {
                failures.push(format!("content store startup failed: {c}"));
                if let Err(e) = self.memoization.shutdown().await {
                    failures.push(format!("memoization store shutdown failed: {e}"));
                }
            }
            (Ok(()), Err(m)) => {
                failures.push(format!("memoization store startup failed: {m}"));
                if let Err(e) = self.content.shutdown().await {
                    failures.push(format!("content store shutdown failed: {e}"));
                }
            }
            (Err(c), Err(m)) => {
                failures.push(format!("content store startup failed: {c}"));
                failures.push(format!("memoization store startup failed: {m}"));
            }
        }

        self.startup_failed.store(true, Ordering::Release);
        error!(failures = ?failures, "two-level cache startup failed");
        Err(CacheError::Aggregate(failures))
    }

    /// Shut both stores down concurrently. Stats are snapshotted first and
    /// kept for [`final_stats`](Self::final_stats).
    pub async fn shutdown(&self) -> CacheResult<()> {
        if !self.startup_completed.load(Ordering::Acquire) {
            return Err(CacheError::NotStarted("two-level cache"));
        }
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Lifecycle("shutdown was already attempted".to_string()));
        }

        let snapshot = self.stats();
        *self.final_stats.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);

        let (content, memoization) =
            tokio::join!(self.content.shutdown(), self.memoization.shutdown());

        let mut failures = Vec::new();
        if let Err(e) = content {
            failures.push(format!("content store shutdown failed: {e}"));
        }
        if let Err(e) = memoization {
            failures.push(format!("memoization store shutdown failed: {e}"));
        }
        self.shutdown_completed.store(true, Ordering::Release);

        if failures.is_empty() {
            info!("two-level cache shut down");
            Ok(())
        } else {
            warn!(failures = ?failures, "two-level cache shutdown reported failures");
            Err(CacheError::Aggregate(failures))
        }
    }

    /// Create the content session and then the memoization session. If the
    /// content session fails, no memoization session is attempted.
    pub async fn create_session(&self, name: &str) -> CacheResult<CacheSession> {
        if self.lifecycle() != Lifecycle::Started {
            return Err(CacheError::NotStarted("two-level cache"));
        }

        let content = self
            .content
            .create_session(name)
            .await
            .map_err(|e| CacheError::Session {
                half: SessionHalf::Content,
                message: e.to_string(),
            })?;

        let threaded = self
            .config
            .pass_content_session_to_memoization
            .then(|| Arc::clone(&content));
        let memoization = self
            .memoization
            .create_session(name, threaded)
            .await
            .map_err(|e| CacheError::Session {
                half: SessionHalf::Memoization,
                message: e.to_string(),
            })?;

        Ok(CacheSession {
            name: name.to_string(),
            content,
            memoization,
        })
    }

    /// Counters of both stores, prefixed `content.` and `memoization.`.
    pub fn stats(&self) -> CounterSet {
        let mut stats = CounterSet::new();
        stats.merge_prefixed("content.", &self.content.stats());
        stats.merge_prefixed("memoization.", &self.memoization.stats());
        stats
    }

    /// The snapshot taken just before shutdown began.
    pub fn final_stats(&self) -> Option<CounterSet> {
        self.final_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn not_implemented(&self, operation: &'static str) -> CacheError {
        CacheError::NotImplemented {
            operation,
            store: self.content.store_name(),
        }
    }

    pub async fn handle_copy_request(
        &self,
        hash: &ContentHash,
        requester: &MachineLocation,
    ) -> CacheResult<CopyRequestOutcome> {
        let handler = self
            .capabilities
            .copy_request
            .as_ref()
            .ok_or_else(|| self.not_implemented("copy request"))?;
        Ok(handler.handle_copy_request(hash, requester).await?)
    }

    pub async fn handle_push(&self, hash: &ContentHash, stream: ByteStream) -> CacheResult<PushDecision> {
        let handler = self
            .capabilities
            .push
            .as_ref()
            .ok_or_else(|| self.not_implemented("push file"))?;
        Ok(handler.handle_push(hash, stream).await?)
    }

    pub async fn stream_content(&self, hash: &ContentHash) -> CacheResult<Option<(u64, ByteStream)>> {
        let store = self
            .capabilities
            .stream
            .as_ref()
            .ok_or_else(|| self.not_implemented("stream content"))?;
        Ok(store.stream_content(hash).await?)
    }

    pub async fn remove_from_tracker(&self) -> CacheResult<u64> {
        let repair = self
            .capabilities
            .repair
            .as_ref()
            .ok_or_else(|| self.not_implemented("remove from tracker"))?;
        Ok(repair.remove_from_tracker().await?)
    }
}
