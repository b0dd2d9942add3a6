//! Peer-to-peer content copy for quarry.
//!
//! This crate provides:
//! - Content address parsing (`host / … / hashType / hash[.blob]`)
//! - A bounded, aged [`ClientPool`] of outbound clients
//! - The [`CopyProtocolHandler`]: existence checks, copies, pushes and
//!   copy requests over HTTP
//! - [`DistributedContentStore`], which fetches missing content from the
//!   peers recorded in the location store

pub mod address;
pub mod client;
pub mod distributed;
pub mod error;
pub mod handler;
pub mod pool;
pub mod wire;

pub use address::ContentAddress;
pub use client::{CopyClient, HttpClientFactory};
pub use distributed::{DistributedContentStore, DistributedSession, LocalContent};
pub use error::{CopyError, CopyFailureReason, CopyResult};
pub use handler::{CopyProtocolHandler, CopyStream, FileExistence, PushOutcome};
pub use pool::{ClientFactory, ClientKey, ClientPool, PoolSettings, PooledClient};
pub use wire::{CopyRequestBody, CopyRequestReply};
