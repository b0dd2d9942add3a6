//! Global entry repository: small string map of store-wide metadata.

use crate::error::MetadataResult;
use async_trait::async_trait;

#[async_trait]
pub trait GlobalRepo: Send + Sync {
    async fn get_global(&self, key: &str) -> MetadataResult<Option<String>>;

    /// Set a global entry. `None` deletes the key.
    async fn set_global(&self, key: &str, value: Option<&str>) -> MetadataResult<()>;
}
