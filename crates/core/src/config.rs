//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:7089").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Location other machines use to reach this one (`host:port`).
    /// Registered in the cluster state at startup.
    #[serde(default = "default_advertised_location")]
    pub advertised_location: String,
    /// Cluster epoch. Persisted cluster state from another epoch is ignored.
    #[serde(default = "default_cluster_epoch")]
    pub cluster_epoch: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:7089".to_string()
}

fn default_advertised_location() -> String {
    "127.0.0.1:7089".to_string()
}

fn default_cluster_epoch() -> String {
    "default".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            advertised_location: default_advertised_location(),
            cluster_epoch: default_cluster_epoch(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_epoch.is_empty() {
            return Err("server.cluster_epoch must not be empty".to_string());
        }
        self.advertised_location
            .parse::<crate::MachineLocation>()
            .map_err(|e| format!("server.advertised_location: {e}"))?;
        Ok(())
    }
}

/// Local content store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for content blobs.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/content")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Location store backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocationBackendConfig {
    /// In-memory map. Location tracking only; memoization is unsupported.
    Memory,
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for LocationBackendConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/locations.db"),
        }
    }
}

/// Write-back buffering in front of the location store backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentCacheConfig {
    /// Buffer writes in memory and flush them in batches.
    #[serde(default)]
    pub enabled: bool,
    /// Number of batches written concurrently during a flush.
    #[serde(default = "default_flush_degree_of_parallelism")]
    pub flush_degree_of_parallelism: usize,
    /// Entries written per backend transaction.
    #[serde(default = "default_flush_transaction_size")]
    pub flush_transaction_size: usize,
    /// Write the whole flush in one transaction, ignoring the two settings above.
    #[serde(default)]
    pub flush_single_transaction: bool,
    /// Percentage of flushed entries kept resident for reads after a flush.
    #[serde(default = "default_flush_preserve_percent_in_memory")]
    pub flush_preserve_percent_in_memory: u8,
    /// Flush once this many updates are pending.
    #[serde(default = "default_cache_maximum_updates_per_flush")]
    pub cache_maximum_updates_per_flush: usize,
    /// Flush at least this often while updates are pending.
    #[serde(default = "default_cache_flushing_maximum_interval_secs")]
    pub cache_flushing_maximum_interval_secs: u64,
}

fn default_flush_degree_of_parallelism() -> usize {
    4
}

fn default_flush_transaction_size() -> usize {
    500
}

fn default_flush_preserve_percent_in_memory() -> u8 {
    50
}

fn default_cache_maximum_updates_per_flush() -> usize {
    10_000
}

fn default_cache_flushing_maximum_interval_secs() -> u64 {
    60
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_degree_of_parallelism: default_flush_degree_of_parallelism(),
            flush_transaction_size: default_flush_transaction_size(),
            flush_single_transaction: false,
            flush_preserve_percent_in_memory: default_flush_preserve_percent_in_memory(),
            cache_maximum_updates_per_flush: default_cache_maximum_updates_per_flush(),
            cache_flushing_maximum_interval_secs: default_cache_flushing_maximum_interval_secs(),
        }
    }
}

impl ContentCacheConfig {
    pub fn flushing_maximum_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_flushing_maximum_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.flush_preserve_percent_in_memory > 100 {
            return Err(format!(
                "content_cache.flush_preserve_percent_in_memory {} exceeds 100",
                self.flush_preserve_percent_in_memory
            ));
        }
        if self.flush_degree_of_parallelism == 0 {
            return Err("content_cache.flush_degree_of_parallelism must be > 0".to_string());
        }
        if self.flush_transaction_size == 0 {
            return Err("content_cache.flush_transaction_size must be > 0".to_string());
        }
        if self.cache_maximum_updates_per_flush == 0 {
            return Err("content_cache.cache_maximum_updates_per_flush must be > 0".to_string());
        }
        if self.enabled && self.cache_flushing_maximum_interval_secs == 0 {
            return Err(
                "content_cache.cache_flushing_maximum_interval_secs must be > 0".to_string(),
            );
        }
        Ok(())
    }
}

/// Content location store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationStoreConfig {
    #[serde(default)]
    pub backend: LocationBackendConfig,
    /// Minimum spacing between GC passes. Entries accessed within this window
    /// are never collected.
    #[serde(default = "default_garbage_collection_interval_secs")]
    pub garbage_collection_interval_secs: u64,
    /// Remove entries not accessed for this long (disabled when unset).
    #[serde(default)]
    pub content_retention_secs: Option<u64>,
    /// Persist cluster membership alongside content metadata.
    #[serde(default = "default_store_cluster_state")]
    pub store_cluster_state: bool,
    #[serde(default)]
    pub content_cache: ContentCacheConfig,
    /// Bound memoization records by count.
    #[serde(default)]
    pub metadata_garbage_collection_enabled: bool,
    /// Memoization records kept by metadata GC.
    #[serde(default = "default_maximum_number_of_entries_to_keep")]
    pub maximum_number_of_entries_to_keep: u64,
    /// Wipe and reinitialize a corrupt backend instead of failing startup.
    #[serde(default)]
    pub on_failure_delete_existing_store_and_retry: bool,
    /// Directory for periodic checkpoints (disabled when unset).
    #[serde(default)]
    pub checkpoint_directory: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Keys fetched per backend page during enumeration.
    #[serde(default = "default_enumeration_page_size")]
    pub enumeration_page_size: usize,
}

fn default_garbage_collection_interval_secs() -> u64 {
    1800 // 30 minutes
}

fn default_store_cluster_state() -> bool {
    true
}

fn default_maximum_number_of_entries_to_keep() -> u64 {
    500_000
}

fn default_checkpoint_interval_secs() -> u64 {
    600
}

fn default_enumeration_page_size() -> usize {
    1000
}

impl Default for LocationStoreConfig {
    fn default() -> Self {
        Self {
            backend: LocationBackendConfig::default(),
            garbage_collection_interval_secs: default_garbage_collection_interval_secs(),
            content_retention_secs: None,
            store_cluster_state: default_store_cluster_state(),
            content_cache: ContentCacheConfig::default(),
            metadata_garbage_collection_enabled: false,
            maximum_number_of_entries_to_keep: default_maximum_number_of_entries_to_keep(),
            on_failure_delete_existing_store_and_retry: false,
            checkpoint_directory: None,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            enumeration_page_size: default_enumeration_page_size(),
        }
    }
}

impl LocationStoreConfig {
    /// GC interval as a time Duration (used for access-time comparisons).
    pub fn garbage_collection_interval(&self) -> Duration {
        let secs = i64::try_from(self.garbage_collection_interval_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn content_retention(&self) -> Option<Duration> {
        self.content_retention_secs
            .map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }

    pub fn checkpoint_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// In-memory configuration used by tests.
    pub fn for_testing() -> Self {
        Self {
            backend: LocationBackendConfig::Memory,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.garbage_collection_interval_secs == 0 {
            return Err("location_store.garbage_collection_interval_secs must be > 0".to_string());
        }
        if self.garbage_collection_interval_secs > i64::MAX as u64 {
            return Err(format!(
                "location_store.garbage_collection_interval_secs {} would overflow Duration",
                self.garbage_collection_interval_secs
            ));
        }
        if self.enumeration_page_size == 0 {
            return Err("location_store.enumeration_page_size must be > 0".to_string());
        }
        if self.checkpoint_directory.is_some() && self.checkpoint_interval_secs == 0 {
            return Err("location_store.checkpoint_interval_secs must be > 0".to_string());
        }
        self.content_cache.validate()
    }
}

/// Copy client pool and transfer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Maximum number of live pooled clients.
    #[serde(default = "default_max_client_count")]
    pub max_client_count: usize,
    /// Clients older than this are retired.
    #[serde(default = "default_max_client_age_minutes")]
    pub max_client_age_minutes: u64,
    /// Interval between pool cleanup passes.
    #[serde(default = "default_cleanup_delay_minutes")]
    pub cleanup_delay_minutes: u64,
    /// Request gzip-compressed transfers.
    #[serde(default)]
    pub use_compression: bool,
    /// Buffer size for streaming copies, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Deadline for establishing a connection to a peer.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Port used when a machine location does not carry one.
    #[serde(default = "default_port")]
    pub default_port: u16,
}

fn default_max_client_count() -> usize {
    512
}

fn default_max_client_age_minutes() -> u64 {
    55
}

fn default_cleanup_delay_minutes() -> u64 {
    17
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_port() -> u16 {
    7089
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            max_client_count: default_max_client_count(),
            max_client_age_minutes: default_max_client_age_minutes(),
            cleanup_delay_minutes: default_cleanup_delay_minutes(),
            use_compression: false,
            buffer_size: default_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            default_port: default_port(),
        }
    }
}

impl CopyConfig {
    pub fn max_client_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_client_age_minutes.saturating_mul(60))
    }

    pub fn cleanup_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_delay_minutes.saturating_mul(60))
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_client_count == 0 {
            return Err("copy.max_client_count must be > 0".to_string());
        }
        if self.cleanup_delay_minutes == 0 {
            return Err("copy.cleanup_delay_minutes must be > 0".to_string());
        }
        if self.buffer_size == 0 {
            return Err("copy.buffer_size must be > 0".to_string());
        }
        if self.connect_timeout_secs == 0 {
            return Err("copy.connect_timeout_secs must be > 0".to_string());
        }
        Ok(())
    }
}

/// Two-level cache composition settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hand the content session to memoization sessions so they can check
    /// content availability before keeping an existing record.
    #[serde(default)]
    pub pass_content_session_to_memoization: bool,
}

/// Full daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub location_store: LocationStoreConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Test configuration: in-memory location store, default everything else.
    pub fn for_testing() -> Self {
        Self {
            location_store: LocationStoreConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.location_store.validate()?;
        self.copy.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_store_defaults_from_empty_json() {
        let config: LocationStoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.garbage_collection_interval_secs, 1800);
        assert!(config.store_cluster_state);
        assert!(!config.content_cache.enabled);
        assert!(matches!(config.backend, LocationBackendConfig::Sqlite { .. }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_tagged_enum() {
        let config: LocationStoreConfig =
            serde_json::from_str(r#"{"backend": {"type": "memory"}}"#).unwrap();
        assert!(matches!(config.backend, LocationBackendConfig::Memory));

        let config: LocationStoreConfig =
            serde_json::from_str(r#"{"backend": {"type": "sqlite", "path": "/tmp/l.db"}}"#)
                .unwrap();
        match config.backend {
            LocationBackendConfig::Sqlite { path } => assert_eq!(path, PathBuf::from("/tmp/l.db")),
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_preserve_percent_over_100_rejected() {
        let mut config = LocationStoreConfig::default();
        config.content_cache.flush_preserve_percent_in_memory = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_gc_interval_rejected() {
        let config = LocationStoreConfig {
            garbage_collection_interval_secs: 0,
            ..LocationStoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_copy_config_rejects_zero_capacity() {
        let config = CopyConfig {
            max_client_count: 0,
            ..CopyConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(CopyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_app_config_for_testing_is_valid() {
        assert!(AppConfig::for_testing().validate().is_ok());
    }
}
