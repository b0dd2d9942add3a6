//! Daemon startup: open the stores, hydrate cluster state, start the cache.

use crate::state::AppState;
use anyhow::{Context, Result, bail};
use quarry_cache::{DatabaseMemoizationStore, TwoLevelCache};
use quarry_copy::{CopyProtocolHandler, DistributedContentStore};
use quarry_core::MachineLocation;
use quarry_core::config::AppConfig;
use quarry_metadata::store::CHECKPOINT_FILE_NAME;
use quarry_metadata::{ClusterState, ContentLocationDatabase};
use std::sync::Arc;

/// Build and start everything the router and the maintenance loops need.
///
/// The local machine is registered in the cluster state under
/// `server.advertised_location`, and the resulting membership is persisted
/// before the state is returned.
pub async fn build_state(config: AppConfig) -> Result<AppState> {
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {e}");
    }
    let local_location: MachineLocation = config
        .server
        .advertised_location
        .parse()
        .context("invalid server.advertised_location")?;

    let database = quarry_metadata::from_config(&config.location_store)
        .await
        .context("failed to open location store")?;
    restore_checkpoint_if_present(&database, &config).await;

    let cluster = Arc::new(ClusterState::new(config.server.cluster_epoch.clone()));
    database
        .update_cluster_state(&cluster, false)
        .await
        .context("failed to load cluster state")?;

    let local = quarry_storage::from_config(&config.storage)
        .context("failed to initialize content store")?;
    let handler = Arc::new(CopyProtocolHandler::new(&config.copy));
    let store = DistributedContentStore::new(
        local,
        Arc::clone(&database),
        Arc::clone(&cluster),
        handler,
        local_location,
    );
    tracing::info!(
        machine = %store.local_machine(),
        location = %store.local_location(),
        epoch = cluster.epoch(),
        "local machine registered"
    );

    let memoization = DatabaseMemoizationStore::new(Arc::clone(&database));
    let cache = TwoLevelCache::new(
        Arc::new(store.clone()),
        Arc::new(memoization),
        config.cache.clone(),
    );
    cache.startup().await.context("cache startup failed")?;

    database
        .update_cluster_state(&cluster, true)
        .await
        .context("failed to persist cluster state")?;

    Ok(AppState::new(config, store, cache))
}

/// Restore the last checkpoint when one exists. A failed restore leaves the
/// store as opened and is only logged.
async fn restore_checkpoint_if_present(database: &ContentLocationDatabase, config: &AppConfig) {
    let Some(directory) = &config.location_store.checkpoint_directory else {
        return;
    };
    if !directory.join(CHECKPOINT_FILE_NAME).exists() {
        tracing::debug!(directory = %directory.display(), "no checkpoint to restore");
        return;
    }
    if let Err(e) = database.restore_checkpoint(directory).await {
        tracing::warn!(
            directory = %directory.display(),
            error = %e,
            "checkpoint restore failed, continuing with the opened store"
        );
    }
}
