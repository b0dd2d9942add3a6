//! Prometheus metrics for quarryd.
//!
//! Covers the peer copy endpoints (content served, pushes, copy requests)
//! and the background maintenance loops (GC, write-back flushes,
//! checkpoints, client pool cleanup).
//!
//! The `/metrics` endpoint is unauthenticated. It exposes aggregate counts
//! only, but should still be reachable only from the Prometheus scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Copy protocol metrics
pub static CONTENT_REQUESTS_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_content_requests_served_total",
        "Total number of content streams served to peers",
    )
    .expect("metric creation failed")
});

pub static CONTENT_REQUESTS_MISSED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_content_requests_missed_total",
        "Total number of content requests for content not held locally",
    )
    .expect("metric creation failed")
});

pub static BYTES_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_bytes_served_total",
        "Total bytes of content streamed to peers",
    )
    .expect("metric creation failed")
});

pub static PUSHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_pushes_total",
            "Total pushed files by outcome (accepted, declined, rejected)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static COPY_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_copy_requests_total",
            "Total copy requests handled by outcome (copied, already_present, failed)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static COPY_REQUEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quarry_copy_request_duration_seconds",
            "Time taken to pull content from a requesting peer",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Maintenance metrics
pub static GC_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_gc_runs_total",
            "Total GC passes by outcome (completed, already_running, failed)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_ENTRIES_REMOVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_gc_entries_removed_total",
        "Total location entries removed by GC",
    )
    .expect("metric creation failed")
});

pub static GC_ENTRIES_CLEANED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_gc_entries_cleaned_total",
        "Total location entries rewritten without inactive machines",
    )
    .expect("metric creation failed")
});

pub static GC_METADATA_REMOVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_gc_metadata_removed_total",
        "Total memoization records removed by GC",
    )
    .expect("metric creation failed")
});

pub static GC_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("quarry_gc_duration_seconds", "GC pass duration")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

pub static CHECKPOINTS_SAVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_checkpoints_saved_total",
        "Total location store checkpoints saved",
    )
    .expect("metric creation failed")
});

pub static CHECKPOINT_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_checkpoint_failures_total",
        "Total checkpoint saves that failed",
    )
    .expect("metric creation failed")
});

pub static FLUSHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_flushes_total",
        "Total write-back flushes that wrote at least one entry",
    )
    .expect("metric creation failed")
});

pub static ENTRIES_FLUSHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_entries_flushed_total",
        "Total location entries written by write-back flushes",
    )
    .expect("metric creation failed")
});

pub static POOL_LIVE_CLIENTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "quarry_pool_live_clients",
        "Copy clients currently held by the client pool",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build several routers in one process.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(CONTENT_REQUESTS_SERVED.clone()),
            Box::new(CONTENT_REQUESTS_MISSED.clone()),
            Box::new(BYTES_SERVED.clone()),
            Box::new(PUSHES.clone()),
            Box::new(COPY_REQUESTS.clone()),
            Box::new(COPY_REQUEST_DURATION.clone()),
            Box::new(GC_RUNS.clone()),
            Box::new(GC_ENTRIES_REMOVED.clone()),
            Box::new(GC_ENTRIES_CLEANED.clone()),
            Box::new(GC_METADATA_REMOVED.clone()),
            Box::new(GC_DURATION.clone()),
            Box::new(CHECKPOINTS_SAVED.clone()),
            Box::new(CHECKPOINT_FAILURES.clone()),
            Box::new(FLUSHES.clone()),
            Box::new(ENTRIES_FLUSHED.clone()),
            Box::new(POOL_LIVE_CLIENTS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

pub fn record_push(outcome: &str) {
    PUSHES.with_label_values(&[outcome]).inc();
}

pub fn record_copy_request(outcome: &str) {
    COPY_REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn record_gc_run(outcome: &str) {
    GC_RUNS.with_label_values(&[outcome]).inc();
}
