//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quarry_cache::CacheError;
use quarry_copy::CopyError;
use quarry_metadata::MetadataError;
use quarry_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("copy error: {0}")]
    Copy(#[from] CopyError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("core error: {0}")]
    Core(#[from] quarry_core::Error),
}

fn storage_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::HashMismatch { .. } => StatusCode::BAD_REQUEST,
        StorageError::NotStarted(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::Remote(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn metadata_status(e: &MetadataError) -> StatusCode {
    if e.is_unsupported() {
        return StatusCode::NOT_IMPLEMENTED;
    }
    match e {
        MetadataError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn copy_status(e: &CopyError) -> StatusCode {
    match e {
        CopyError::SourcePathMalformed { .. } => StatusCode::BAD_REQUEST,
        CopyError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        CopyError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CopyError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        CopyError::Storage(inner) => storage_status(inner),
        CopyError::Metadata(inner) => metadata_status(inner),
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
            Self::Storage(StorageError::HashMismatch { .. }) => "hash_mismatch",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Copy(_) => "copy_error",
            Self::Cache(e) if e.is_unsupported() => "not_implemented",
            Self::Cache(CacheError::Storage(StorageError::HashMismatch { .. })) => "hash_mismatch",
            Self::Cache(_) => "cache_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => storage_status(e),
            Self::Metadata(e) => metadata_status(e),
            Self::Copy(e) => copy_status(e),
            Self::Cache(e) => match e {
                CacheError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
                CacheError::NotStarted(_) | CacheError::Lifecycle(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CacheError::Storage(inner) => storage_status(inner),
                CacheError::Metadata(inner) => metadata_status(inner),
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
