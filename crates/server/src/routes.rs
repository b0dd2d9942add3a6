//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, head, post};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        // Only reads are compressed; HEAD must keep the exact Content-Length.
        .route(
            "/content/{hash_type}/{hash}",
            get(handlers::get_content).layer(CompressionLayer::new()),
        )
        .route(
            "/content/{hash_type}/{hash}",
            head(handlers::head_content).put(handlers::put_content),
        )
        .route(
            "/content/{hash_type}/{hash}/copy-request",
            post(handlers::copy_request),
        );

    // Keep /metrics network-restricted to the Prometheus scraper when enabled.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
