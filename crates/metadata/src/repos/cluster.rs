//! Persisted cluster membership.

use crate::cluster::MachineRecord;
use crate::error::MetadataResult;
use async_trait::async_trait;

#[async_trait]
pub trait ClusterRepo: Send + Sync {
    async fn load_machines(&self) -> MetadataResult<Vec<MachineRecord>>;

    /// Replace the persisted machine table with `machines`.
    async fn store_machines(&self, machines: &[MachineRecord]) -> MetadataResult<()>;
}
