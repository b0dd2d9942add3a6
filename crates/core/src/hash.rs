//! Content hash types: the full typed hash and its truncated `ShortHash` key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of hash bytes kept in a [`ShortHash`] (the type byte comes first).
pub const SHORT_HASH_HASH_BYTES: usize = 11;

/// Total width of a [`ShortHash`] in bytes.
pub const SHORT_HASH_LEN: usize = SHORT_HASH_HASH_BYTES + 1;

/// Hash algorithms understood by the copy protocol and the location store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HashType {
    Sha1,
    Sha256,
    Md5,
    Vso0,
    DedupNode,
    DedupChunk,
}

impl HashType {
    pub const ALL: [HashType; 6] = [
        HashType::Sha1,
        HashType::Sha256,
        HashType::Md5,
        HashType::Vso0,
        HashType::DedupNode,
        HashType::DedupChunk,
    ];

    /// Canonical name used in addresses and URLs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Md5 => "MD5",
            Self::Vso0 => "VSO0",
            Self::DedupNode => "DedupNode",
            Self::DedupChunk => "DedupChunk",
        }
    }

    /// Nominal digest length in bytes.
    pub fn byte_length(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Md5 => 16,
            Self::Vso0 => 33,
            Self::Sha256 | Self::DedupNode | Self::DedupChunk => 32,
        }
    }

    /// Stable single-byte tag stored as the first byte of a [`ShortHash`].
    pub fn tag(self) -> u8 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256 => 2,
            Self::Md5 => 3,
            Self::Vso0 => 4,
            Self::DedupNode => 5,
            Self::DedupChunk => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashType {
    type Err = crate::Error;

    /// Case-insensitive match against the canonical names.
    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::UnknownHashType(s.to_string()))
    }
}

/// A typed content hash.
///
/// The byte length is not checked against [`HashType::byte_length`]; the copy
/// protocol accepts whatever digest bytes the address carries.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    hash_type: HashType,
    bytes: Vec<u8>,
}

impl ContentHash {
    pub fn new(hash_type: HashType, bytes: Vec<u8>) -> crate::Result<Self> {
        if bytes.is_empty() {
            return Err(crate::Error::InvalidHash("empty hash".to_string()));
        }
        Ok(Self { hash_type, bytes })
    }

    /// Compute the SHA-256 hash of data.
    pub fn compute_sha256(data: &[u8]) -> Self {
        Self {
            hash_type: HashType::Sha256,
            bytes: Sha256::digest(data).to_vec(),
        }
    }

    /// Create an incremental SHA-256 hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Parse hex digest bytes for the given hash type.
    pub fn from_hex(hash_type: HashType, s: &str) -> crate::Result<Self> {
        Self::new(hash_type, decode_hex(s)?)
    }

    /// Encode the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.bytes)
    }

    /// Truncate to the fixed-width key used by the location store.
    pub fn to_short_hash(&self) -> ShortHash {
        let mut out = [0u8; SHORT_HASH_LEN];
        out[0] = self.hash_type.tag();
        let n = self.bytes.len().min(SHORT_HASH_HASH_BYTES);
        out[1..=n].copy_from_slice(&self.bytes[..n]);
        ShortHash(out)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({}:{})", self.hash_type, &hex[..hex.len().min(16)])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_type, self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = crate::Error;

    /// Parse the `TYPE:hex` form produced by `Display`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let (ty, hex) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::InvalidHash(format!("missing hash type in {s}")))?;
        Self::from_hex(ty.parse()?, hex)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.to_string()
    }
}

/// Incremental SHA-256 hasher.
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash {
            hash_type: HashType::Sha256,
            bytes: self.0.finalize().to_vec(),
        }
    }
}

/// Fixed-width truncated content hash: one type byte followed by the first
/// [`SHORT_HASH_HASH_BYTES`] bytes of the digest.
///
/// Ordering is lexicographic on the raw bytes, which is the iteration order of
/// every location store backend.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortHash([u8; SHORT_HASH_LEN]);

impl ShortHash {
    pub const MIN: ShortHash = ShortHash([0u8; SHORT_HASH_LEN]);

    pub fn from_bytes(bytes: [u8; SHORT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; SHORT_HASH_LEN] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidHash(format!(
                "expected {SHORT_HASH_LEN} short hash bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SHORT_HASH_LEN] {
        &self.0
    }

    pub fn hash_type(&self) -> Option<HashType> {
        HashType::from_tag(self.0[0])
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        Self::from_slice(&decode_hex(s)?)
    }

    /// The smallest short hash strictly greater than `self`, or `None` at the
    /// top of the key space. Used to resume paged scans.
    pub fn successor(&self) -> Option<Self> {
        let mut next = self.0;
        for byte in next.iter_mut().rev() {
            if *byte == u8::MAX {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(Self(next));
            }
        }
        None
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({})", self.to_hex())
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&ContentHash> for ShortHash {
    fn from(h: &ContentHash) -> Self {
        h.to_short_hash()
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn decode_hex(s: &str) -> crate::Result<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return Err(crate::Error::InvalidHash(format!(
            "hex string must have an even, non-zero length: {s:?}"
        )));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hex_str =
                std::str::from_utf8(pair).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            u8::from_str_radix(hex_str, 16).map_err(|e| crate::Error::InvalidHash(e.to_string()))
        })
        .collect()
}
