//! quarryd: the quarry cache daemon.
//!
//! This crate provides the HTTP side of a cache node:
//! - Peer copy protocol endpoints (existence, streaming reads, pushes,
//!   copy requests)
//! - Health and Prometheus metrics endpoints
//! - Startup wiring of the location store, content store and cache
//! - Background GC, write-back flush, checkpoint and pool cleanup loops

pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod metrics;
pub mod routes;
pub mod state;

pub use bootstrap::build_state;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
