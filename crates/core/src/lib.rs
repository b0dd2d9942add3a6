//! Core domain types for the quarry distributed build cache.
//!
//! This crate defines the data model shared by all other crates:
//! - Typed content hashes and the truncated `ShortHash` location key
//! - Machine ids and machine locations
//! - Content location entries
//! - Memoization records (fingerprints, selectors, content hash lists)
//! - Counters and configuration

pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod hash;
pub mod machine;
pub mod stats;

pub use entry::ContentLocationEntry;
pub use error::{Error, Result};
pub use fingerprint::{
    CacheDeterminism, ContentHashList, ContentHashListWithDeterminism, Fingerprint, Selector,
    StrongFingerprint,
};
pub use hash::{ContentHash, ContentHasher, HashType, ShortHash};
pub use machine::{MachineId, MachineLocation};
pub use stats::CounterSet;

/// Global entry key holding the cluster epoch of persisted cluster state.
pub const CLUSTER_EPOCH_KEY: &str = "cluster.epoch";
