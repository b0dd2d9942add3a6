//! Copy protocol operations against peer machines.

use crate::address::ContentAddress;
use crate::client::{CopyClient, HttpClientFactory};
use crate::error::{CopyError, CopyResult};
use crate::pool::{ClientKey, ClientPool, PoolSettings, PooledClient};
use crate::wire::{self, CopyRequestBody, CopyRequestReply};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use quarry_core::config::CopyConfig;
use quarry_core::{ContentHash, CounterSet, MachineLocation};
use quarry_storage::{ByteStream, StorageError, StorageResult};
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Bytes fetched from a peer.
pub type CopyStream = Pin<Box<dyn Stream<Item = CopyResult<Bytes>> + Send>>;

/// Outcome of an existence check. A timeout is reported on its own and is
/// never folded into `NotExists`.
#[derive(Debug)]
pub enum FileExistence {
    Exists { size: Option<u64> },
    NotExists,
    TimedOut,
    Error(CopyError),
}

impl FileExistence {
    pub fn exists(&self) -> bool {
        matches!(self, FileExistence::Exists { .. })
    }

    /// Classify a failed check. Any deadline that expired, including the
    /// pool's connect deadline, is a timeout.
    pub fn from_error(error: CopyError) -> Self {
        match error {
            CopyError::TimedOut(_) => FileExistence::TimedOut,
            other => FileExistence::Error(other),
        }
    }
}

/// Outcome of pushing content to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed { bytes: u64 },
    /// The peer already had the content and declined the push.
    AlreadyPresent,
}

#[derive(Default)]
struct HandlerCounters {
    existence_checks: AtomicU64,
    existence_timeouts: AtomicU64,
    copies: AtomicU64,
    bytes_copied: AtomicU64,
    pushes: AtomicU64,
    pushes_declined: AtomicU64,
    copy_requests: AtomicU64,
}

/// Performs copy protocol operations through a pooled set of clients.
pub struct CopyProtocolHandler {
    pool: ClientPool<HttpClientFactory>,
    config: CopyConfig,
    counters: HandlerCounters,
}

impl CopyProtocolHandler {
    pub fn new(config: &CopyConfig) -> Self {
        let pool = ClientPool::new(
            HttpClientFactory::new(config),
            PoolSettings::from_config(config),
        );
        Self {
            pool,
            config: config.clone(),
            counters: HandlerCounters::default(),
        }
    }

    pub fn pool(&self) -> &ClientPool<HttpClientFactory> {
        &self.pool
    }

    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    fn key_for(&self, location: &MachineLocation) -> ClientKey {
        ClientKey::new(
            location.host(),
            location.port_or(self.config.default_port),
            self.config.use_compression,
        )
    }

    async fn client(&self, location: &MachineLocation) -> CopyResult<PooledClient<HttpClientFactory>> {
        self.pool.acquire(self.key_for(location)).await
    }

    /// Check whether the peer named by `address` holds the content, giving
    /// up after `timeout`.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn check_existence(&self, address: &ContentAddress, timeout: Duration) -> FileExistence {
        self.counters.existence_checks.fetch_add(1, Ordering::Relaxed);
        let existence = match tokio::time::timeout(timeout, self.query_existence(address)).await {
            Ok(Ok(existence)) => existence,
            Ok(Err(e)) => FileExistence::from_error(e),
            Err(_) => FileExistence::TimedOut,
        };
        if matches!(existence, FileExistence::TimedOut) {
            self.counters.existence_timeouts.fetch_add(1, Ordering::Relaxed);
            debug!("existence check timed out");
        }
        existence
    }

    async fn query_existence(&self, address: &ContentAddress) -> CopyResult<FileExistence> {
        let mut client = self.client(address.location()).await?;
        let existence = head(&client, address.hash()).await?;
        client.mark_reusable();
        Ok(existence)
    }

    /// Open a stream of the content at `address`.
    ///
    /// The pooled client travels with the stream and goes back to the pool
    /// only once the body has been read to the end. Cancelling `cancel` ends
    /// the stream with [`CopyError::Cancelled`].
    #[instrument(skip_all, fields(address = %address))]
    pub async fn open_stream(
        &self,
        address: &ContentAddress,
        cancel: &CancellationToken,
    ) -> CopyResult<(Option<u64>, CopyStream)> {
        let client = self.client(address.location()).await?;
        let url = client.url(&wire::content_path(address.hash()));
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            response = client.send(client.http().get(url)) => response?,
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let mut client = client;
            client.mark_reusable();
            return Err(CopyError::ContentNotFound(address.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CopyError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let size = response.content_length();
        let mut body = response.bytes_stream();
        let cancel = cancel.clone();
        let stream: CopyStream = Box::pin(async_stream::try_stream! {
            let mut client = client;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = body.next() => Some(chunk),
                };
                match next {
                    None => Err::<(), _>(CopyError::Cancelled)?,
                    Some(None) => break,
                    Some(Some(chunk)) => {
                        let chunk = chunk.map_err(|e| CopyError::Transfer(e.to_string()))?;
                        yield chunk;
                    }
                }
            }
            client.mark_reusable();
        });

        Ok((size, stream))
    }

    /// Copy the content at `address` into `sink`. Returns the number of bytes
    /// copied; a length other than `expected_size` is a transfer error.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn copy_to<W>(
        &self,
        address: &ContentAddress,
        sink: &mut W,
        expected_size: Option<u64>,
        cancel: &CancellationToken,
    ) -> CopyResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (_, mut stream) = self.open_stream(address, cancel).await?;
        let mut writer = BufWriter::with_capacity(self.config.buffer_size, sink);
        let mut copied = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await.map_err(StorageError::Io)?;
            copied += chunk.len() as u64;
        }
        writer.flush().await.map_err(StorageError::Io)?;

        if let Some(expected) = expected_size
            && expected != copied
        {
            return Err(CopyError::SizeMismatch {
                expected,
                actual: copied,
            });
        }

        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_copied.fetch_add(copied, Ordering::Relaxed);
        debug!(bytes = copied, "copied content from peer");
        Ok(copied)
    }

    /// Push content to `target`. The source is only opened when the target
    /// does not already hold the content.
    #[instrument(skip_all, fields(hash = %hash, target = %target))]
    pub async fn push_file<F, Fut>(
        &self,
        hash: &ContentHash,
        source: F,
        target: &MachineLocation,
    ) -> CopyResult<PushOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = StorageResult<Option<ByteStream>>> + Send,
    {
        let mut client = self.client(target).await?;
        if head(&client, hash).await?.exists() {
            client.mark_reusable();
            self.counters.pushes_declined.fetch_add(1, Ordering::Relaxed);
            return Ok(PushOutcome::AlreadyPresent);
        }

        let stream = source()
            .await?
            .ok_or_else(|| StorageError::NotFound(hash.to_string()))?;
        let sent = Arc::new(AtomicU64::new(0));
        let counted = {
            let sent = Arc::clone(&sent);
            stream.inspect_ok(move |chunk| {
                sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
        };

        let url = client.url(&wire::content_path(hash));
        let response = client
            .send(client.http().put(url).body(reqwest::Body::wrap_stream(counted)))
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                client.mark_reusable();
                let bytes = sent.load(Ordering::Relaxed);
                self.counters.pushes.fetch_add(1, Ordering::Relaxed);
                Ok(PushOutcome::Pushed { bytes })
            }
            StatusCode::OK => {
                client.mark_reusable();
                self.counters.pushes_declined.fetch_add(1, Ordering::Relaxed);
                Ok(PushOutcome::AlreadyPresent)
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), %message, "peer rejected push");
                Err(CopyError::Rejected {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Ask `target` to pull the content from `requester`.
    #[instrument(skip_all, fields(hash = %hash, target = %target))]
    pub async fn request_copy(
        &self,
        hash: &ContentHash,
        target: &MachineLocation,
        requester: &MachineLocation,
    ) -> CopyResult<CopyRequestReply> {
        self.counters.copy_requests.fetch_add(1, Ordering::Relaxed);
        let mut client = self.client(target).await?;
        let body = CopyRequestBody {
            requester: requester.clone(),
        };
        let url = client.url(&wire::copy_request_path(hash));
        let response = client.send(client.http().post(url).json(&body)).await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CopyError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let reply = response
            .json::<CopyRequestReply>()
            .await
            .map_err(|e| CopyError::Transfer(format!("invalid copy-request reply: {e}")))?;
        client.mark_reusable();
        Ok(reply)
    }

    pub fn stats(&self) -> CounterSet {
        let c = &self.counters;
        let mut stats = CounterSet::new();
        for (name, counter) in [
            ("existence_checks", &c.existence_checks),
            ("existence_timeouts", &c.existence_timeouts),
            ("copies", &c.copies),
            ("bytes_copied", &c.bytes_copied),
            ("pushes", &c.pushes),
            ("pushes_declined", &c.pushes_declined),
            ("copy_requests", &c.copy_requests),
        ] {
            stats.set(name, counter.load(Ordering::Relaxed) as i64);
        }
        stats.merge_prefixed("pool.", &self.pool.stats());
        stats
    }
}

async fn head(client: &CopyClient, hash: &ContentHash) -> CopyResult<FileExistence> {
    let url = client.url(&wire::content_path(hash));
    let response = client.send(client.http().head(url)).await?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(FileExistence::NotExists),
        status if status.is_success() => {
            let size = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            Ok(FileExistence::Exists { size })
        }
        status => Err(CopyError::Rejected {
            status: status.as_u16(),
            message: format!("existence check failed for {hash}"),
        }),
    }
}

/// Adapt a peer stream for a content store.
pub fn into_byte_stream(stream: CopyStream) -> ByteStream {
    Box::pin(stream.map_err(StorageError::from))
}
