//! Health check endpoint.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use quarry_cache::{CacheError, Lifecycle};
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Id of this machine in the cluster state.
    pub machine_id: u32,
    /// Location peers use to reach this machine.
    pub location: String,
    pub cluster_epoch: String,
}

/// GET /health
///
/// 503 unless the cache is started and the location store answers.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let lifecycle = state.cache.lifecycle();
    if lifecycle != Lifecycle::Started {
        return Err(ApiError::Cache(CacheError::Lifecycle(format!(
            "cache is {lifecycle:?}"
        ))));
    }
    state.database().health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        machine_id: state.store.local_machine().as_u32(),
        location: state.store.local_location().to_string(),
        cluster_epoch: state.cluster().epoch().to_string(),
    }))
}
