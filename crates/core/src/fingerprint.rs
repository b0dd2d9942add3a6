//! Memoization record types: fingerprints, selectors and content hash lists.

use crate::hash::{ContentHash, decode_hex, encode_hex};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque fingerprint bytes, serialized as hex.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        Ok(Self(decode_hex(s)?))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(f: Fingerprint) -> Self {
        f.to_hex()
    }
}

/// Narrows a weak fingerprint to one cached variant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub content_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
}

impl Selector {
    pub fn new(content_hash: ContentHash) -> Self {
        Self {
            content_hash,
            output: None,
        }
    }

    pub fn with_output(content_hash: ContentHash, output: Vec<u8>) -> Self {
        Self {
            content_hash,
            output: Some(output),
        }
    }
}

/// Deterministic key for a single cached build-step result.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrongFingerprint {
    pub weak_fingerprint: Fingerprint,
    pub selector: Selector,
}

impl StrongFingerprint {
    pub fn new(weak_fingerprint: Fingerprint, selector: Selector) -> Self {
        Self {
            weak_fingerprint,
            selector,
        }
    }
}

impl fmt::Display for StrongFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.weak_fingerprint, self.selector.content_hash
        )
    }
}

/// Ordered list of output content hashes with an optional opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashList {
    pub hashes: Vec<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl ContentHashList {
    pub fn new(hashes: Vec<ContentHash>) -> Self {
        Self {
            hashes,
            payload: None,
        }
    }
}

/// How trustworthy a published content hash list is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CacheDeterminism {
    /// Produced by a non-deterministic step; may be replaced.
    None,
    /// Pinned by a cache instance until `expires`.
    Cache {
        guid: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        expires: OffsetDateTime,
    },
    /// The producing tool is known to be deterministic; never replaced.
    Tool,
}

impl CacheDeterminism {
    pub fn is_deterministic(&self, now: OffsetDateTime) -> bool {
        match self {
            Self::None => false,
            Self::Cache { expires, .. } => *expires > now,
            Self::Tool => true,
        }
    }

    /// Whether a stored value carrying `self` should give way to a value
    /// carrying `incoming`.
    pub fn should_be_replaced_by(&self, incoming: &CacheDeterminism, now: OffsetDateTime) -> bool {
        match (self, incoming) {
            (Self::Tool, _) => false,
            (_, Self::Tool) => true,
            (Self::Cache { guid: a, .. }, Self::Cache { guid: b, .. }) if a == b => false,
            (existing, incoming) => {
                !existing.is_deterministic(now) && incoming.is_deterministic(now)
            }
        }
    }
}

/// A memoization record value.
///
/// `content_hash_list` is `None` when the record is absent; this doubles as
/// the "expected absence" marker for compare-exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashListWithDeterminism {
    pub content_hash_list: Option<ContentHashList>,
    pub determinism: CacheDeterminism,
}

impl ContentHashListWithDeterminism {
    pub fn new(content_hash_list: ContentHashList, determinism: CacheDeterminism) -> Self {
        Self {
            content_hash_list: Some(content_hash_list),
            determinism,
        }
    }

    /// The absent record.
    pub fn missing() -> Self {
        Self {
            content_hash_list: None,
            determinism: CacheDeterminism::None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.content_hash_list.is_none()
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
