//! Content location and memoization metadata for quarry.
//!
//! This crate provides the location tracking layer:
//! - `ShortHash -> ContentLocationEntry` storage over pluggable backends
//!   (in-memory map or SQLite)
//! - Memoization records with compare-exchange (SQLite only)
//! - Write-back buffering, paged enumeration and checkpoints
//! - Cluster state (machine ids, locations, liveness)
//! - Garbage collection of stale locations and records

pub mod cluster;
mod content_cache;
pub mod database;
pub mod enumeration;
pub mod error;
pub mod gc;
pub mod memory;
pub mod repos;
pub mod store;

pub use cluster::{ClusterState, InactiveMachinesFeed, MachineRecord};
pub use database::{ContentLocationDatabase, EntryStream, KeyStream, StrongFingerprintStream};
pub use enumeration::EnumerationFilter;
pub use error::{MetadataError, MetadataResult};
pub use gc::{GcOutcome, GcStats};
pub use memory::MemoryStore;
pub use store::{LocationBackend, SqliteStore};

use quarry_core::config::{LocationBackendConfig, LocationStoreConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Open the configured backend.
///
/// A corrupt SQLite file is deleted and recreated when
/// `on_failure_delete_existing_store_and_retry` is set; otherwise the
/// corruption error is returned.
pub async fn open_backend(config: &LocationStoreConfig) -> MetadataResult<Arc<dyn LocationBackend>> {
    match &config.backend {
        LocationBackendConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        LocationBackendConfig::Sqlite { path } => match SqliteStore::open(path).await {
            Ok(store) => Ok(Arc::new(store)),
            Err(MetadataError::Corruption(detail))
                if config.on_failure_delete_existing_store_and_retry =>
            {
                warn!(
                    path = %path.display(),
                    detail = %detail,
                    "location store is corrupt, deleting it and starting empty"
                );
                store::remove_database_files(path)?;
                Ok(Arc::new(SqliteStore::open(path).await?))
            }
            Err(e) => Err(e),
        },
    }
}

/// Create and initialize a location database from configuration.
pub async fn from_config(config: &LocationStoreConfig) -> MetadataResult<Arc<ContentLocationDatabase>> {
    config.validate().map_err(MetadataError::Config)?;
    let backend = open_backend(config).await?;
    let database = ContentLocationDatabase::new(backend, config.clone());
    database.initialize().await?;
    info!(
        backend = database.backend_name(),
        write_back = config.content_cache.enabled,
        "location database ready"
    );
    Ok(Arc::new(database))
}
