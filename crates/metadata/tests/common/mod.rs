//! Shared helpers for location database tests.

use quarry_core::config::{ContentCacheConfig, LocationBackendConfig, LocationStoreConfig};
use quarry_core::{
    CacheDeterminism, ContentHash, ContentHashList, ContentHashListWithDeterminism, Fingerprint,
    Selector, ShortHash, StrongFingerprint,
};
use quarry_metadata::ContentLocationDatabase;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A database together with the temp dir that backs it.
#[allow(dead_code)]
pub struct TestDatabase {
    pub database: Arc<ContentLocationDatabase>,
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TestDatabase {
    pub async fn sqlite() -> Self {
        Self::sqlite_with(|_| {}).await
    }

    pub async fn sqlite_with(customize: impl FnOnce(&mut LocationStoreConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = LocationStoreConfig {
            backend: LocationBackendConfig::Sqlite {
                path: dir.path().join("locations.db"),
            },
            ..LocationStoreConfig::default()
        };
        customize(&mut config);
        let database = quarry_metadata::from_config(&config)
            .await
            .expect("open sqlite database");
        Self { database, dir }
    }

    pub async fn memory() -> Self {
        Self::memory_with(|_| {}).await
    }

    pub async fn memory_with(customize: impl FnOnce(&mut LocationStoreConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = LocationStoreConfig::for_testing();
        customize(&mut config);
        let database = quarry_metadata::from_config(&config)
            .await
            .expect("open memory database");
        Self { database, dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Enable write-back buffering with a cap high enough that tests decide when to flush.
#[allow(dead_code)]
pub fn write_back(config: &mut LocationStoreConfig) {
    config.content_cache = ContentCacheConfig {
        enabled: true,
        cache_maximum_updates_per_flush: 1_000,
        flush_transaction_size: 2,
        ..ContentCacheConfig::default()
    };
}

#[allow(dead_code)]
pub fn short_hash(seed: &str) -> ShortHash {
    ContentHash::compute_sha256(seed.as_bytes()).to_short_hash()
}

/// Three short hashes in ascending order.
#[allow(dead_code)]
pub fn sorted_hashes(seeds: &[&str]) -> Vec<ShortHash> {
    let mut hashes: Vec<ShortHash> = seeds.iter().map(|s| short_hash(s)).collect();
    hashes.sort();
    hashes
}

#[allow(dead_code)]
pub fn strong_fingerprint(seed: &str) -> StrongFingerprint {
    StrongFingerprint::new(
        Fingerprint::new(seed.as_bytes().to_vec()),
        Selector::new(ContentHash::compute_sha256(format!("selector-{seed}").as_bytes())),
    )
}

#[allow(dead_code)]
pub fn record(seed: &str, determinism: CacheDeterminism) -> ContentHashListWithDeterminism {
    ContentHashListWithDeterminism::new(
        ContentHashList::new(vec![ContentHash::compute_sha256(seed.as_bytes())]),
        determinism,
    )
}
