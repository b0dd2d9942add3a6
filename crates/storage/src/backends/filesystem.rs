//! Local filesystem content store.
//!
//! Blobs live at `{root}/{HASHTYPE}/{hex[..2]}/{hex}.blob`. Writes go to a
//! uniquely named temp file that is synced and then renamed into place, so a
//! blob is either absent or complete.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ContentCapabilities, ContentSession, ContentStore, PushDecision, PushFileHandler,
    PutResult, StreamStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use quarry_core::{ContentHash, CounterSet, HashType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const BLOB_EXTENSION: &str = "blob";

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    bytes_written: AtomicU64,
    already_present: AtomicU64,
    reads: AtomicU64,
    read_misses: AtomicU64,
    hash_mismatches: AtomicU64,
    sessions: AtomicU64,
}

struct Inner {
    root: PathBuf,
    started: AtomicBool,
    counters: Counters,
}

/// Content store backed by a local directory tree.
#[derive(Clone)]
pub struct FilesystemContentStore {
    inner: Arc<Inner>,
}

impl FilesystemContentStore {
    /// Create a store rooted at `root`. Nothing touches disk until `startup`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.as_ref().to_path_buf(),
                started: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Path of the blob for `hash`.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        let prefix = &hex[..hex.len().min(2)];
        self.inner
            .root
            .join(hash.hash_type().name())
            .join(prefix)
            .join(format!("{hex}.{BLOB_EXTENSION}"))
    }

    fn ensure_started(&self) -> StorageResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(StorageError::NotStarted("filesystem"))
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or(temp_name),
        )
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    pub async fn contains(&self, hash: &ContentHash) -> StorageResult<bool> {
        self.ensure_started()?;
        Ok(fs::try_exists(self.blob_path(hash)).await?)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    pub async fn content_size(&self, hash: &ContentHash) -> StorageResult<Option<u64>> {
        self.ensure_started()?;
        match fs::metadata(self.blob_path(hash)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Open the blob for `hash` as a chunked stream, with its size.
    #[instrument(skip(self), fields(backend = "filesystem"))]
    pub async fn open(&self, hash: &ContentHash) -> StorageResult<Option<(u64, ByteStream)>> {
        self.ensure_started()?;
        let counters = &self.inner.counters;
        counters.reads.fetch_add(1, Ordering::Relaxed);

        let file = match fs::File::open(self.blob_path(hash)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                counters.read_misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        let size = file.metadata().await?.len();

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Some((size, Box::pin(stream))))
    }

    /// Store `data` under its SHA-256 hash.
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    pub async fn put_bytes(&self, data: Bytes) -> StorageResult<PutResult> {
        self.ensure_started()?;
        let hash = ContentHash::compute_sha256(&data);
        let size = data.len() as u64;
        let path = self.blob_path(&hash);

        if fs::try_exists(&path).await? {
            self.inner
                .counters
                .already_present
                .fetch_add(1, Ordering::Relaxed);
            return Ok(PutResult {
                hash,
                size,
                already_present: true,
            });
        }

        Self::ensure_parent(&path).await?;
        let temp_path = Self::temp_path(&path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;
        self.record_put(size);

        Ok(PutResult {
            hash,
            size,
            already_present: false,
        })
    }

    /// Store a stream under `expected`.
    ///
    /// SHA-256 content is hashed while it is written and rejected on mismatch.
    /// Other hash types are stored as addressed.
    #[instrument(skip(self, stream), fields(backend = "filesystem"))]
    pub async fn put_stream(
        &self,
        expected: &ContentHash,
        mut stream: ByteStream,
    ) -> StorageResult<PutResult> {
        self.ensure_started()?;
        let path = self.blob_path(expected);
        Self::ensure_parent(&path).await?;
        let temp_path = Self::temp_path(&path);

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut hasher = ContentHash::hasher();
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<_, StorageError>((size, hasher.finalize()))
        }
        .await;

        let (size, actual) = match written {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if expected.hash_type() == HashType::Sha256 && &actual != expected {
            let _ = fs::remove_file(&temp_path).await;
            self.inner
                .counters
                .hash_mismatches
                .fetch_add(1, Ordering::Relaxed);
            warn!(expected = %expected, actual = %actual, "rejecting content with wrong hash");
            return Err(StorageError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        if fs::try_exists(&path).await? {
            let _ = fs::remove_file(&temp_path).await;
            self.inner
                .counters
                .already_present
                .fetch_add(1, Ordering::Relaxed);
            return Ok(PutResult {
                hash: expected.clone(),
                size,
                already_present: true,
            });
        }

        fs::rename(&temp_path, &path).await?;
        self.record_put(size);
        debug!(hash = %expected, size, "stored content");

        Ok(PutResult {
            hash: expected.clone(),
            size,
            already_present: false,
        })
    }

    fn record_put(&self, size: u64) {
        let counters = &self.inner.counters;
        counters.puts.fetch_add(1, Ordering::Relaxed);
        counters.bytes_written.fetch_add(size, Ordering::Relaxed);
    }
}

#[async_trait]
impl ContentStore for FilesystemContentStore {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn startup(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.inner.root).await?;
        self.inner.started.store(true, Ordering::Release);
        debug!(root = %self.inner.root.display(), "filesystem store started");
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        self.inner.started.store(false, Ordering::Release);
        Ok(())
    }

    async fn create_session(&self, name: &str) -> StorageResult<Arc<dyn ContentSession>> {
        self.ensure_started()?;
        self.inner.counters.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(FilesystemSession {
            name: name.to_string(),
            store: self.clone(),
        }))
    }

    fn stats(&self) -> CounterSet {
        let c = &self.inner.counters;
        let mut stats = CounterSet::new();
        for (name, counter) in [
            ("puts", &c.puts),
            ("bytes_written", &c.bytes_written),
            ("already_present", &c.already_present),
            ("reads", &c.reads),
            ("read_misses", &c.read_misses),
            ("hash_mismatches", &c.hash_mismatches),
            ("sessions", &c.sessions),
        ] {
            stats.set(name, counter.load(Ordering::Relaxed) as i64);
        }
        stats
    }

    fn capabilities(&self) -> ContentCapabilities {
        ContentCapabilities {
            stream: Some(Arc::new(self.clone())),
            push: Some(Arc::new(self.clone())),
            ..Default::default()
        }
    }

    fn store_name(&self) -> &'static str {
        "filesystem"
    }
}

#[async_trait]
impl StreamStore for FilesystemContentStore {
    async fn stream_content(&self, hash: &ContentHash) -> StorageResult<Option<(u64, ByteStream)>> {
        self.open(hash).await
    }
}

#[async_trait]
impl PushFileHandler for FilesystemContentStore {
    async fn handle_push(
        &self,
        hash: &ContentHash,
        stream: ByteStream,
    ) -> StorageResult<PushDecision> {
        if self.contains(hash).await? {
            return Ok(PushDecision::Declined);
        }
        let result = self.put_stream(hash, stream).await?;
        Ok(PushDecision::Accepted(result))
    }
}

/// Session over a [`FilesystemContentStore`].
pub struct FilesystemSession {
    name: String,
    store: FilesystemContentStore,
}

#[async_trait]
impl ContentSession for FilesystemSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn contains(&self, hash: &ContentHash) -> StorageResult<bool> {
        self.store.contains(hash).await
    }

    async fn content_size(&self, hash: &ContentHash) -> StorageResult<Option<u64>> {
        self.store.content_size(hash).await
    }

    async fn open_stream(&self, hash: &ContentHash) -> StorageResult<Option<ByteStream>> {
        Ok(self.store.open(hash).await?.map(|(_, stream)| stream))
    }

    async fn put_bytes(&self, data: Bytes) -> StorageResult<PutResult> {
        self.store.put_bytes(data).await
    }

    async fn put_stream(
        &self,
        expected: &ContentHash,
        stream: ByteStream,
    ) -> StorageResult<PutResult> {
        self.store.put_stream(expected, stream).await
    }
}
