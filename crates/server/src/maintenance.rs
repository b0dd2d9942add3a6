//! Background maintenance: GC, write-back flushes, checkpoints, client pool
//! cleanup and cluster state persistence.
//!
//! Every loop stops when the state's shutdown token is cancelled. Failures
//! are logged and counted; they never end a loop.

use crate::metrics::{
    CHECKPOINT_FAILURES, CHECKPOINTS_SAVED, ENTRIES_FLUSHED, FLUSHES, GC_DURATION,
    GC_ENTRIES_CLEANED, GC_ENTRIES_REMOVED, GC_METADATA_REMOVED, POOL_LIVE_CLIENTS, record_gc_run,
};
use crate::state::AppState;
use quarry_cache::CacheResult;
use quarry_metadata::{GcOutcome, MetadataResult};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lower bound for every loop period; a zero interval would spin.
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound for the flush loop period. `flush_if_due` decides whether a
/// tick actually flushes.
const MAX_FLUSH_PERIOD: Duration = Duration::from_secs(5);

/// Run one GC pass and persist cluster membership afterwards.
pub async fn run_gc_pass(state: &AppState) -> MetadataResult<GcOutcome> {
    let start = Instant::now();
    let outcome = state.database().garbage_collect(state.cluster()).await;
    match &outcome {
        Ok(GcOutcome::Completed(stats)) => {
            record_gc_run("completed");
            GC_DURATION.observe(start.elapsed().as_secs_f64());
            GC_ENTRIES_REMOVED.inc_by(stats.entries_removed);
            GC_ENTRIES_CLEANED.inc_by(stats.entries_cleaned);
            GC_METADATA_REMOVED.inc_by(stats.metadata_removed);
        }
        Ok(GcOutcome::AlreadyRunning) => record_gc_run("already_running"),
        Err(_) => record_gc_run("failed"),
    }
    let outcome = outcome?;

    state
        .database()
        .update_cluster_state(state.cluster(), true)
        .await?;
    Ok(outcome)
}

/// Flush buffered location writes if the write-back cache says a flush is due.
pub async fn run_flush(state: &AppState) -> MetadataResult<usize> {
    let flushed = state.database().flush_if_due().await?;
    if flushed > 0 {
        FLUSHES.inc();
        ENTRIES_FLUSHED.inc_by(flushed as u64);
        debug!(entries = flushed, "write-back flush");
    }
    Ok(flushed)
}

/// Save a checkpoint of the location store into `directory`.
pub async fn run_checkpoint(state: &AppState, directory: &Path) -> MetadataResult<()> {
    match state.database().save_checkpoint(directory).await {
        Ok(()) => {
            CHECKPOINTS_SAVED.inc();
            Ok(())
        }
        Err(e) => {
            CHECKPOINT_FAILURES.inc();
            Err(e)
        }
    }
}

/// Spawn a loop running `tick` every `period` until shutdown. The first tick
/// happens one period after spawning.
fn spawn_periodic<F, Fut>(state: &AppState, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(AppState) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let state = state.clone();
    let period = period.max(MIN_PERIOD);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        info!(task = name, period_ms = period.as_millis() as u64, "maintenance loop started");
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => tick(state.clone()).await,
            }
        }
        debug!(task = name, "maintenance loop stopped");
    })
}

/// Spawn every maintenance loop the configuration enables.
pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let config = &state.config;
    let mut handles = Vec::new();

    let gc_period = Duration::from_secs(config.location_store.garbage_collection_interval_secs);
    handles.push(spawn_periodic(state, "gc", gc_period, |state| async move {
        match run_gc_pass(&state).await {
            Ok(GcOutcome::Completed(stats)) => info!(?stats, "GC pass completed"),
            Ok(GcOutcome::AlreadyRunning) => debug!("GC pass already running, skipped"),
            Err(e) => error!(error = %e, "GC pass failed"),
        }
    }));

    if config.location_store.content_cache.enabled {
        let period = config
            .location_store
            .content_cache
            .flushing_maximum_interval()
            .min(MAX_FLUSH_PERIOD);
        handles.push(spawn_periodic(state, "flush", period, |state| async move {
            if let Err(e) = run_flush(&state).await {
                warn!(error = %e, "write-back flush failed");
            }
        }));
    }

    if let Some(directory) = config.location_store.checkpoint_directory.clone() {
        let period = config.location_store.checkpoint_interval();
        handles.push(spawn_periodic(state, "checkpoint", period, move |state| {
            let directory = directory.clone();
            async move {
                if let Err(e) = run_checkpoint(&state, &directory).await {
                    error!(directory = %directory.display(), error = %e, "checkpoint failed");
                }
            }
        }));
    }

    let pool = state.store.handler().pool();
    handles.push(pool.spawn_cleanup(config.copy.cleanup_delay().max(MIN_PERIOD), state.shutdown.clone()));
    handles.push(spawn_periodic(state, "pool-gauge", Duration::from_secs(15), |state| async move {
        POOL_LIVE_CLIENTS.set(state.store.handler().pool().live_count() as i64);
    }));

    handles
}

/// Stop the maintenance loops, persist cluster state and shut the cache down.
pub async fn shutdown(state: &AppState, handles: Vec<JoinHandle<()>>) -> CacheResult<()> {
    state.shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "maintenance task ended abnormally");
        }
    }

    if let Err(e) = state
        .database()
        .update_cluster_state(state.cluster(), true)
        .await
    {
        warn!(error = %e, "failed to persist cluster state at shutdown");
    }
    state.cache.shutdown().await?;
    if let Some(stats) = state.cache.final_stats() {
        for (name, value) in stats.iter() {
            debug!(counter = name, value, "final counter");
        }
    }
    info!("shutdown complete");
    Ok(())
}
