//! Shared helpers for copy protocol tests.

use bytes::Bytes;
use httpmock::MockServer;
use quarry_core::MachineLocation;
use quarry_core::config::{CopyConfig, LocationStoreConfig};
use quarry_copy::{CopyProtocolHandler, DistributedContentStore};
use quarry_metadata::ClusterState;
use quarry_storage::{ByteStream, ContentStore, FilesystemContentStore, StorageError};
use std::net::TcpListener;
use std::sync::Arc;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

#[allow(dead_code)]
pub fn location_of(server: &MockServer) -> MachineLocation {
    MachineLocation::new("127.0.0.1", Some(server.port())).expect("valid location")
}

#[allow(dead_code)]
pub fn handler() -> CopyProtocolHandler {
    CopyProtocolHandler::new(&CopyConfig::default())
}

#[allow(dead_code)]
pub fn stream_of(data: &'static [u8]) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok::<_, StorageError>(
        Bytes::from_static(data),
    )]))
}

/// A started distributed store with an in-memory location database.
#[allow(dead_code)]
pub struct Node {
    pub store: DistributedContentStore,
    pub cluster: Arc<ClusterState>,
    pub dir: TempDir,
}

#[allow(dead_code)]
impl Node {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let database = quarry_metadata::from_config(&LocationStoreConfig::for_testing())
            .await
            .expect("memory database");
        let cluster = Arc::new(ClusterState::new("test"));
        let local = FilesystemContentStore::new(dir.path().join("content"));
        let store = DistributedContentStore::new(
            local,
            database,
            Arc::clone(&cluster),
            Arc::new(handler()),
            "127.0.0.1:1".parse().expect("location"),
        );
        store.startup().await.expect("startup");
        Self {
            store,
            cluster,
            dir,
        }
    }
}
