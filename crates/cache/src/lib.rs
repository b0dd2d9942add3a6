//! Memoization and the two-level cache for quarry.
//!
//! - [`MemoizationStore`] / [`MemoizationSession`]: strong-fingerprint keyed
//!   records with compare-exchange as the only mutation path
//! - [`DatabaseMemoizationStore`]: records kept in the location database
//! - [`TwoLevelCache`]: a content store and a memoization store with a joint
//!   lifecycle, composite sessions and capability delegation

pub mod composer;
pub mod error;
pub mod memoization;

pub use composer::{CacheSession, Lifecycle, TwoLevelCache};
pub use error::{CacheError, CacheResult, SessionHalf};
pub use memoization::{
    AddOrGetOutcome, DatabaseMemoizationSession, DatabaseMemoizationStore, MemoizationSession,
    MemoizationStore,
};
