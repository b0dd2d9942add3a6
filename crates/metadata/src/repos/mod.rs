//! Repository traits implemented by location store backends.

pub mod checkpoint;
pub mod cluster;
pub mod entries;
pub mod global;
pub mod memoization;

pub use checkpoint::CheckpointRepo;
pub use cluster::ClusterRepo;
pub use entries::{EntryRepo, EntryUpdate};
pub use global::GlobalRepo;
pub use memoization::MemoizationRepo;
