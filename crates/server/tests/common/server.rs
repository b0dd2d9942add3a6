//! Server test utilities.

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use quarry_core::MachineLocation;
use quarry_core::config::{AppConfig, LocationBackendConfig, LocationStoreConfig, StorageConfig};
use quarry_server::{AppState, build_state, create_router};
use std::net::TcpListener as StdTcpListener;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Config rooted in `dir`: filesystem content and a SQLite location store.
pub fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        storage: StorageConfig {
            root: dir.path().join("content"),
        },
        location_store: LocationStoreConfig {
            backend: LocationBackendConfig::Sqlite {
                path: dir.path().join("locations.db"),
            },
            ..LocationStoreConfig::default()
        },
        ..AppConfig::default()
    }
}

/// A started node driven through `oneshot` requests.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(|_, _| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig, &TempDir),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = test_config(&temp_dir);
        modifier(&mut config, &temp_dir);

        quarry_server::metrics::register_metrics();
        let state = build_state(config).await.expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            temp_dir,
        }
    }

    pub async fn request(&self, method: &str, uri: &str, body: Body) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    pub async fn json_request(
        &self,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

/// Whether the sandbox lets tests listen on loopback.
#[allow(dead_code)]
pub fn can_bind_localhost() -> bool {
    StdTcpListener::bind("127.0.0.1:0").is_ok()
}

/// A node serving its router on a real loopback socket.
#[allow(dead_code)]
pub struct LiveServer {
    pub state: AppState,
    pub location: MachineLocation,
    serve: JoinHandle<()>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl LiveServer {
    pub async fn start() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind loopback listener");
        let addr = listener.local_addr().unwrap();

        let mut config = test_config(&temp_dir);
        config.server.bind = addr.to_string();
        config.server.advertised_location = addr.to_string();

        quarry_server::metrics::register_metrics();
        let state = build_state(config).await.expect("Failed to build state");
        let router = create_router(state.clone());
        let serve = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        Self {
            location: addr.to_string().parse().unwrap(),
            state,
            serve,
            _temp_dir: temp_dir,
        }
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.serve.abort();
    }
}
