//! Peer copy protocol endpoints.
//!
//! Peers check existence (`HEAD`), read (`GET`), push (`PUT`) and ask this machine to
//! pull content from them (`POST .../copy-request`). Reads and pushes go
//! through the cache's content capabilities, so a content store without a
//! capability answers 501.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{
    BYTES_SERVED, CONTENT_REQUESTS_MISSED, CONTENT_REQUESTS_SERVED, COPY_REQUEST_DURATION,
    record_copy_request, record_push,
};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use quarry_copy::{CopyRequestBody, CopyRequestReply};
use quarry_core::{ContentHash, HashType};
use quarry_storage::{ByteStream, CopyRequestOutcome, PushDecision, StorageError};
use std::time::Instant;

const BLOB_SUFFIX: &str = ".blob";

/// Parse the `{hash_type}/{hash}` path segments. A trailing `.blob` on the
/// hash is accepted and ignored.
pub fn parse_content_hash(hash_type: &str, hash: &str) -> ApiResult<ContentHash> {
    let hash_type: HashType = hash_type
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let hex = match hash.len().checked_sub(BLOB_SUFFIX.len()) {
        Some(at) if hash.is_char_boundary(at) && hash[at..].eq_ignore_ascii_case(BLOB_SUFFIX) => {
            &hash[..at]
        }
        _ => hash,
    };
    ContentHash::from_hex(hash_type, hex)
        .map_err(|e| ApiError::BadRequest(format!("invalid content hash: {e}")))
}

/// HEAD /content/{hash_type}/{hash}
pub async fn head_content(
    State(state): State<AppState>,
    Path((hash_type, hash)): Path<(String, String)>,
) -> ApiResult<Response> {
    let hash = parse_content_hash(&hash_type, &hash)?;
    match state.store.local().content_size(&hash).await? {
        Some(size) => Ok((StatusCode::OK, [(CONTENT_LENGTH, size.to_string())]).into_response()),
        None => Err(ApiError::NotFound(format!("content {hash}"))),
    }
}

/// GET /content/{hash_type}/{hash}
pub async fn get_content(
    State(state): State<AppState>,
    Path((hash_type, hash)): Path<(String, String)>,
) -> ApiResult<Response> {
    let hash = parse_content_hash(&hash_type, &hash)?;
    let Some((size, stream)) = state.cache.stream_content(&hash).await? else {
        CONTENT_REQUESTS_MISSED.inc();
        return Err(ApiError::NotFound(format!("content {hash}")));
    };

    CONTENT_REQUESTS_SERVED.inc();
    BYTES_SERVED.inc_by(size);
    tracing::debug!(hash = %hash, size, "serving content");

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream"),
            (CONTENT_LENGTH, &size.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// PUT /content/{hash_type}/{hash}
///
/// 201 when stored, 200 when the content was already present, 400 when the
/// body does not hash to the address.
pub async fn put_content(
    State(state): State<AppState>,
    Path((hash_type, hash)): Path<(String, String)>,
    body: Body,
) -> ApiResult<StatusCode> {
    let hash = parse_content_hash(&hash_type, &hash)?;
    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map_err(|e| StorageError::Io(std::io::Error::other(e))),
    );

    match state.cache.handle_push(&hash, stream).await {
        Ok(PushDecision::Accepted(put)) => {
            record_push("accepted");
            tracing::info!(hash = %hash, size = put.size, "pushed content stored");
            Ok(StatusCode::CREATED)
        }
        Ok(PushDecision::Declined) => {
            record_push("declined");
            tracing::debug!(hash = %hash, "pushed content already present");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            record_push("rejected");
            tracing::warn!(hash = %hash, error = %e, "push rejected");
            Err(e.into())
        }
    }
}

/// POST /content/{hash_type}/{hash}/copy-request
pub async fn copy_request(
    State(state): State<AppState>,
    Path((hash_type, hash)): Path<(String, String)>,
    Json(request): Json<CopyRequestBody>,
) -> ApiResult<Json<CopyRequestReply>> {
    let hash = parse_content_hash(&hash_type, &hash)?;
    let start = Instant::now();
    let outcome = state
        .cache
        .handle_copy_request(&hash, &request.requester)
        .await;
    COPY_REQUEST_DURATION.observe(start.elapsed().as_secs_f64());

    match outcome {
        Ok(CopyRequestOutcome::Copied { bytes }) => {
            record_copy_request("copied");
            tracing::info!(hash = %hash, requester = %request.requester, bytes, "copied content from requester");
            Ok(Json(CopyRequestReply::Copied { bytes }))
        }
        Ok(CopyRequestOutcome::AlreadyPresent) => {
            record_copy_request("already_present");
            Ok(Json(CopyRequestReply::AlreadyPresent))
        }
        Err(e) => {
            record_copy_request("failed");
            tracing::warn!(hash = %hash, requester = %request.requester, error = %e, "copy request failed");
            Err(e.into())
        }
    }
}
