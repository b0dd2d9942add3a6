//! Application state shared across handlers and background tasks.

use quarry_cache::TwoLevelCache;
use quarry_copy::DistributedContentStore;
use quarry_core::config::AppConfig;
use quarry_metadata::{ClusterState, ContentLocationDatabase};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Local content plus location-aware peer copies.
    pub store: DistributedContentStore,
    /// Content and memoization stores behind one lifecycle.
    pub cache: Arc<TwoLevelCache>,
    /// Cancelled when the daemon begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: DistributedContentStore, cache: TwoLevelCache) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cache: Arc::new(cache),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn database(&self) -> &Arc<ContentLocationDatabase> {
        self.store.database()
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        self.store.cluster()
    }
}
