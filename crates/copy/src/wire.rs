//! HTTP wire format shared by the copy client and the daemon.
//!
//! - `HEAD /content/{hashType}/{hash}`: 200 present, 404 absent
//! - `GET  /content/{hashType}/{hash}`: streamed bytes
//! - `PUT  /content/{hashType}/{hash}`: 201 stored, 200 already present
//! - `POST /content/{hashType}/{hash}/copy-request`: ask the peer to pull
//!   the content from `requester`

use quarry_core::{ContentHash, MachineLocation};
use serde::{Deserialize, Serialize};

/// Path of the content resource for `hash`.
pub fn content_path(hash: &ContentHash) -> String {
    format!("/content/{}/{}", hash.hash_type(), hash.to_hex())
}

pub fn copy_request_path(hash: &ContentHash) -> String {
    format!("{}/copy-request", content_path(hash))
}

/// Body of a copy request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequestBody {
    pub requester: MachineLocation,
}

/// Reply to a copy request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CopyRequestReply {
    Copied { bytes: u64 },
    AlreadyPresent,
}
