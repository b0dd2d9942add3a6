//! HTTP copy client and the factory the pool uses to create it.

use crate::error::{CopyError, CopyResult};
use crate::pool::{ClientFactory, ClientKey};
use async_trait::async_trait;
use quarry_core::config::CopyConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// An HTTP client bound to one peer.
#[derive(Clone, Debug)]
pub struct CopyClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
}

impl CopyClient {
    pub fn new(key: &ClientKey, connect_timeout: Duration) -> CopyResult<Self> {
        let http = reqwest::Client::builder()
            .gzip(key.use_compression)
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| CopyError::Transfer(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", key.host, key.port),
            host: key.to_string(),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, classifying transport failures.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> CopyResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| CopyError::from_reqwest(&self.host, e))
    }
}

/// Creates [`CopyClient`]s after checking the peer accepts connections.
#[derive(Clone, Debug)]
pub struct HttpClientFactory {
    connect_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(config: &CopyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    type Client = CopyClient;

    async fn connect(&self, key: &ClientKey) -> CopyResult<CopyClient> {
        TcpStream::connect((key.host.as_str(), key.port))
            .await
            .map_err(|e| CopyError::Unreachable {
                host: key.to_string(),
                message: e.to_string(),
            })?;
        debug!(peer = %key, "peer reachable, creating copy client");
        CopyClient::new(key, self.connect_timeout)
    }
}
