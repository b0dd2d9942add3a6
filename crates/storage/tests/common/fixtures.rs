use bytes::Bytes;
use futures::stream;
use quarry_storage::{ByteStream, ContentStore, FilesystemContentStore, StorageResult};
use std::path::{Path, PathBuf};

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// A started store rooted under `root`.
#[allow(dead_code)]
pub async fn started_store(root: &Path) -> FilesystemContentStore {
    let store = FilesystemContentStore::new(root.join("content"));
    store.startup().await.unwrap();
    store
}

/// Split `data` into a stream of `chunk`-sized pieces.
#[allow(dead_code)]
pub fn chunked(data: Bytes, chunk: usize) -> ByteStream {
    let pieces: Vec<StorageResult<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(stream::iter(pieces))
}

/// Every file under `root`, recursively.
#[allow(dead_code)]
pub fn blob_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
