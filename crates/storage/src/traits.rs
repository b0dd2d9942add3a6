//! Content store trait definitions and optional capabilities.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use quarry_core::{ContentHash, CounterSet, MachineLocation};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Outcome of storing content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub hash: ContentHash,
    pub size: u64,
    /// The content was already stored; nothing was written.
    pub already_present: bool,
}

/// A content store with an explicit lifecycle.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn startup(&self) -> StorageResult<()>;

    async fn shutdown(&self) -> StorageResult<()>;

    /// Open a named session for content operations.
    async fn create_session(&self, name: &str) -> StorageResult<Arc<dyn ContentSession>>;

    fn stats(&self) -> CounterSet;

    /// Optional capabilities, resolved once by the implementation.
    fn capabilities(&self) -> ContentCapabilities;

    /// Short name used in logs and errors.
    fn store_name(&self) -> &'static str;
}

/// Per-caller handle for reading and writing content.
#[async_trait]
pub trait ContentSession: Send + Sync {
    fn name(&self) -> &str;

    async fn contains(&self, hash: &ContentHash) -> StorageResult<bool>;

    /// Size of the stored content, or `None` if absent.
    async fn content_size(&self, hash: &ContentHash) -> StorageResult<Option<u64>>;

    /// Open the content for reading, or `None` if absent.
    async fn open_stream(&self, hash: &ContentHash) -> StorageResult<Option<ByteStream>>;

    /// Store bytes under their SHA-256 hash.
    async fn put_bytes(&self, data: Bytes) -> StorageResult<PutResult>;

    /// Store a stream under `expected`. SHA-256 content is verified.
    async fn put_stream(&self, expected: &ContentHash, stream: ByteStream)
    -> StorageResult<PutResult>;
}

/// Serve stored content as a stream with its size.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn stream_content(&self, hash: &ContentHash) -> StorageResult<Option<(u64, ByteStream)>>;
}

/// Whether an incoming push was taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushDecision {
    Accepted(PutResult),
    /// The content is already present; the push was not needed.
    Declined,
}

/// Accept content pushed by a peer.
#[async_trait]
pub trait PushFileHandler: Send + Sync {
    async fn handle_push(&self, hash: &ContentHash, stream: ByteStream)
    -> StorageResult<PushDecision>;
}

/// Result of a copy request from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyRequestOutcome {
    Copied { bytes: u64 },
    AlreadyPresent,
}

/// Pull content from a requesting peer on its behalf.
#[async_trait]
pub trait CopyRequestHandler: Send + Sync {
    async fn handle_copy_request(
        &self,
        hash: &ContentHash,
        requester: &MachineLocation,
    ) -> StorageResult<CopyRequestOutcome>;
}

/// Repair operations over the location tracker.
#[async_trait]
pub trait RepairStore: Send + Sync {
    /// Remove this machine from every tracked location entry. Returns the
    /// number of entries updated.
    async fn remove_from_tracker(&self) -> StorageResult<u64>;
}

/// Present/absent handles for optional store capabilities.
#[derive(Clone, Default)]
pub struct ContentCapabilities {
    pub stream: Option<Arc<dyn StreamStore>>,
    pub push: Option<Arc<dyn PushFileHandler>>,
    pub copy_request: Option<Arc<dyn CopyRequestHandler>>,
    pub repair: Option<Arc<dyn RepairStore>>,
}

impl fmt::Debug for ContentCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCapabilities")
            .field("stream", &self.stream.is_some())
            .field("push", &self.push.is_some())
            .field("copy_request", &self.copy_request.is_some())
            .field("repair", &self.repair.is_some())
            .finish()
    }
}
