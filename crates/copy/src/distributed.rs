//! Location-aware content store that pulls missing content from peers.
//!
//! Local writes go to the filesystem store and register this machine in the
//! content's location entry. Reads of content that is not held locally are
//! served by copying it from the peers the location entry lists, skipping
//! inactive machines and this machine.

use crate::address::ContentAddress;
use crate::error::{CopyError, CopyResult};
use crate::handler::{CopyProtocolHandler, PushOutcome, into_byte_stream};
use crate::wire::CopyRequestReply;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use quarry_core::{ContentHash, CounterSet, MachineId, MachineLocation};
use quarry_metadata::{ClusterState, ContentLocationDatabase, MetadataError};
use quarry_storage::{
    ByteStream, ContentCapabilities, ContentSession, ContentStore, CopyRequestHandler,
    CopyRequestOutcome, FilesystemContentStore, PushDecision, PushFileHandler, PutResult,
    RepairStore, StorageError, StorageResult,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Where `ensure_local` found the content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalContent {
    AlreadyLocal,
    Copied { from: MachineLocation, bytes: u64 },
}

#[derive(Default)]
struct DistributedCounters {
    registrations: AtomicU64,
    peer_fetches: AtomicU64,
    peer_fetch_failures: AtomicU64,
    copy_requests_served: AtomicU64,
    pushes_accepted: AtomicU64,
}

fn tracker_error(err: MetadataError) -> StorageError {
    StorageError::Remote(format!("location tracker: {err}"))
}

/// Content store spanning the local disk and the peers of the cluster.
#[derive(Clone)]
pub struct DistributedContentStore {
    local: FilesystemContentStore,
    database: Arc<ContentLocationDatabase>,
    cluster: Arc<ClusterState>,
    handler: Arc<CopyProtocolHandler>,
    local_location: MachineLocation,
    local_machine: MachineId,
    counters: Arc<DistributedCounters>,
}

impl DistributedContentStore {
    pub fn new(
        local: FilesystemContentStore,
        database: Arc<ContentLocationDatabase>,
        cluster: Arc<ClusterState>,
        handler: Arc<CopyProtocolHandler>,
        local_location: MachineLocation,
    ) -> Self {
        let local_machine = cluster.register_local_machine(&local_location);
        Self {
            local,
            database,
            cluster,
            handler,
            local_location,
            local_machine,
            counters: Arc::new(DistributedCounters::default()),
        }
    }

    pub fn local(&self) -> &FilesystemContentStore {
        &self.local
    }

    pub fn database(&self) -> &Arc<ContentLocationDatabase> {
        &self.database
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn handler(&self) -> &Arc<CopyProtocolHandler> {
        &self.handler
    }

    pub fn local_machine(&self) -> MachineId {
        self.local_machine
    }

    pub fn local_location(&self) -> &MachineLocation {
        &self.local_location
    }

    async fn register(&self, machine: MachineId, hash: &ContentHash, size: u64) -> StorageResult<()> {
        self.database
            .add_location(&hash.to_short_hash(), machine, size as i64)
            .await
            .map_err(tracker_error)?;
        self.counters.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Store bytes locally and register this machine as a holder.
    pub async fn put_bytes(&self, data: Bytes) -> StorageResult<PutResult> {
        let result = self.local.put_bytes(data).await?;
        self.register(self.local_machine, &result.hash, result.size).await?;
        Ok(result)
    }

    /// Store a stream locally and register this machine as a holder.
    pub async fn put_stream(&self, expected: &ContentHash, stream: ByteStream) -> StorageResult<PutResult> {
        let result = self.local.put_stream(expected, stream).await?;
        self.register(self.local_machine, &result.hash, result.size).await?;
        Ok(result)
    }

    /// Active peers recorded as holding `hash`, in machine id order.
    pub async fn peer_locations(&self, hash: &ContentHash) -> CopyResult<Vec<MachineLocation>> {
        let Some(entry) = self.database.try_get_entry(&hash.to_short_hash()).await? else {
            return Ok(Vec::new());
        };
        let inactive = self.cluster.inactive_machines();
        Ok(entry
            .locations
            .iter()
            .filter(|id| **id != self.local_machine && !inactive.contains(id))
            .filter_map(|id| self.cluster.resolve(*id))
            .collect())
    }

    /// Make `hash` available locally, copying it from a peer if needed.
    ///
    /// Peers are tried in turn; a failure that another location might not
    /// have moves on to the next one.
    #[instrument(skip(self, cancel), fields(hash = %hash))]
    pub async fn ensure_local(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> CopyResult<LocalContent> {
        if self.local.contains(hash).await? {
            return Ok(LocalContent::AlreadyLocal);
        }

        let candidates = self.peer_locations(hash).await?;
        let mut last_error = None;
        for location in candidates {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            let address = ContentAddress::new(location.clone(), hash.clone());
            match self.fetch(&address, cancel).await {
                Ok(put) => {
                    self.register(self.local_machine, hash, put.size).await?;
                    self.counters.peer_fetches.fetch_add(1, Ordering::Relaxed);
                    info!(from = %location, bytes = put.size, "copied content from peer");
                    return Ok(LocalContent::Copied {
                        from: location,
                        bytes: put.size,
                    });
                }
                Err(e) if e.is_retryable() => {
                    self.counters.peer_fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(from = %location, error = %e, "copy from peer failed, trying next location");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        Err(last_error
            .unwrap_or_else(|| CopyError::ContentNotFound(format!("{hash}: no active peer holds it"))))
    }

    async fn fetch(&self, address: &ContentAddress, cancel: &CancellationToken) -> CopyResult<PutResult> {
        let (_, stream) = self.handler.open_stream(address, cancel).await?;
        let put = self
            .local
            .put_stream(address.hash(), into_byte_stream(stream))
            .await?;
        Ok(put)
    }

    /// Push local content to `target`.
    pub async fn push_to(&self, hash: &ContentHash, target: &MachineLocation) -> CopyResult<PushOutcome> {
        let local = self.local.clone();
        let source_hash = hash.clone();
        self.handler
            .push_file(
                hash,
                move || async move { Ok(local.open(&source_hash).await?.map(|(_, stream)| stream)) },
                target,
            )
            .await
    }

    /// Ask `target` to pull `hash` from this machine.
    pub async fn request_copy_to(
        &self,
        hash: &ContentHash,
        target: &MachineLocation,
    ) -> CopyResult<CopyRequestReply> {
        self.handler
            .request_copy(hash, target, &self.local_location)
            .await
    }
}

#[async_trait]
impl ContentStore for DistributedContentStore {
    async fn startup(&self) -> StorageResult<()> {
        self.local.startup().await?;
        self.database.initialize().await.map_err(tracker_error)?;
        debug!(machine = %self.local_machine, location = %self.local_location, "distributed store started");
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        let flushed = self.database.flush().await;
        let local = self.local.shutdown().await;
        flushed.map_err(tracker_error)?;
        local
    }

    async fn create_session(&self, name: &str) -> StorageResult<Arc<dyn ContentSession>> {
        if !self.local.is_started() {
            return Err(StorageError::NotStarted("distributed"));
        }
        Ok(Arc::new(DistributedSession {
            name: name.to_string(),
            store: self.clone(),
        }))
    }

    fn stats(&self) -> CounterSet {
        let c = &self.counters;
        let mut stats = self.local.stats();
        for (name, counter) in [
            ("registrations", &c.registrations),
            ("peer_fetches", &c.peer_fetches),
            ("peer_fetch_failures", &c.peer_fetch_failures),
            ("copy_requests_served", &c.copy_requests_served),
            ("pushes_accepted", &c.pushes_accepted),
        ] {
            stats.set(name, counter.load(Ordering::Relaxed) as i64);
        }
        stats.merge_prefixed("copy.", &self.handler.stats());
        stats
    }

    fn capabilities(&self) -> ContentCapabilities {
        ContentCapabilities {
            stream: self.local.capabilities().stream,
            push: Some(Arc::new(self.clone())),
            copy_request: Some(Arc::new(self.clone())),
            repair: Some(Arc::new(self.clone())),
        }
    }

    fn store_name(&self) -> &'static str {
        "distributed"
    }
}

#[async_trait]
impl PushFileHandler for DistributedContentStore {
    async fn handle_push(&self, hash: &ContentHash, stream: ByteStream) -> StorageResult<PushDecision> {
        let decision = self.local.handle_push(hash, stream).await?;
        if let PushDecision::Accepted(put) = &decision {
            self.register(self.local_machine, hash, put.size).await?;
            self.counters.pushes_accepted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(decision)
    }
}

#[async_trait]
impl CopyRequestHandler for DistributedContentStore {
    /// Pull `hash` from `requester`, which also gets recorded as a holder.
    async fn handle_copy_request(
        &self,
        hash: &ContentHash,
        requester: &MachineLocation,
    ) -> StorageResult<CopyRequestOutcome> {
        let requester_id = self.cluster.register_machine(requester);

        if let Some(size) = self.local.content_size(hash).await? {
            self.register(requester_id, hash, size).await?;
            return Ok(CopyRequestOutcome::AlreadyPresent);
        }

        let address = ContentAddress::new(requester.clone(), hash.clone());
        let put = self.fetch(&address, &CancellationToken::new()).await?;
        self.register(self.local_machine, hash, put.size).await?;
        self.register(requester_id, hash, put.size).await?;
        self.counters.copy_requests_served.fetch_add(1, Ordering::Relaxed);
        Ok(CopyRequestOutcome::Copied { bytes: put.size })
    }
}

#[async_trait]
impl RepairStore for DistributedContentStore {
    async fn remove_from_tracker(&self) -> StorageResult<u64> {
        let mut held = Vec::new();
        let mut entries = self
            .database
            .enumerate_entries_with_sorted_keys(CancellationToken::new(), None);
        while let Some(item) = entries.next().await {
            let (hash, entry) = item.map_err(tracker_error)?;
            if entry.has_location(self.local_machine) {
                held.push(hash);
            }
        }
        drop(entries);

        for hash in &held {
            self.database
                .remove_location(hash, self.local_machine)
                .await
                .map_err(tracker_error)?;
        }
        info!(entries = held.len(), machine = %self.local_machine, "removed machine from location tracker");
        Ok(held.len() as u64)
    }
}

/// Session over a [`DistributedContentStore`].
pub struct DistributedSession {
    name: String,
    store: DistributedContentStore,
}

#[async_trait]
impl ContentSession for DistributedSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn contains(&self, hash: &ContentHash) -> StorageResult<bool> {
        self.store.local.contains(hash).await
    }

    /// Local size, falling back to the size the tracker recorded.
    async fn content_size(&self, hash: &ContentHash) -> StorageResult<Option<u64>> {
        if let Some(size) = self.store.local.content_size(hash).await? {
            return Ok(Some(size));
        }
        let entry = self
            .store
            .database
            .try_get_entry(&hash.to_short_hash())
            .await
            .map_err(tracker_error)?;
        Ok(entry.and_then(|e| u64::try_from(e.content_size).ok()))
    }

    async fn open_stream(&self, hash: &ContentHash) -> StorageResult<Option<ByteStream>> {
        match self.store.ensure_local(hash, &CancellationToken::new()).await {
            Ok(_) => {}
            Err(CopyError::ContentNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(self.store.local.open(hash).await?.map(|(_, stream)| stream))
    }

    async fn put_bytes(&self, data: Bytes) -> StorageResult<PutResult> {
        self.store.put_bytes(data).await
    }

    async fn put_stream(&self, expected: &ContentHash, stream: ByteStream) -> StorageResult<PutResult> {
        self.store.put_stream(expected, stream).await
    }
}
