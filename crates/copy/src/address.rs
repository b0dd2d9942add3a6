//! Content addresses used by the copy protocol.
//!
//! A content address is a path of at least four segments:
//! `host[:port] / … / hashType / hash[.blob]`. Both `/` and `\` separate
//! segments and empty segments are ignored. The hash type is matched
//! case-insensitively against the known hash names.

use crate::error::{CopyError, CopyResult};
use quarry_core::{ContentHash, HashType, MachineLocation};
use std::fmt;

const MIN_SEGMENTS: usize = 4;
const BLOB_SUFFIX: &str = ".blob";

/// A parsed `(machine, content hash)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentAddress {
    location: MachineLocation,
    hash: ContentHash,
}

impl ContentAddress {
    pub fn new(location: MachineLocation, hash: ContentHash) -> Self {
        Self { location, hash }
    }

    /// Parse a source path. Failures are local errors, never network ones.
    pub fn parse(path: &str) -> CopyResult<Self> {
        let segments: Vec<&str> = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .collect();
        if segments.len() < MIN_SEGMENTS {
            return Err(CopyError::malformed(
                path,
                format!(
                    "expected at least {MIN_SEGMENTS} segments, found {}",
                    segments.len()
                ),
            ));
        }

        let location: MachineLocation = segments[0]
            .parse()
            .map_err(|e| CopyError::malformed(path, format!("bad host segment: {e}")))?;

        let type_segment = segments[segments.len() - 2];
        let hash_type: HashType = type_segment
            .parse()
            .map_err(|_| CopyError::malformed(path, format!("unknown hash type {type_segment:?}")))?;

        let last = segments[segments.len() - 1];
        let hex = strip_suffix_ignore_case(last, BLOB_SUFFIX);
        let hash = ContentHash::from_hex(hash_type, hex)
            .map_err(|e| CopyError::malformed(path, format!("bad hash segment: {e}")))?;

        Ok(Self { location, hash })
    }

    pub fn location(&self) -> &MachineLocation {
        &self.location
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn hash_type(&self) -> HashType {
        self.hash.hash_type()
    }

    /// Path form accepted by [`parse`](Self::parse).
    pub fn to_path(&self) -> String {
        format!(
            "{}{}{BLOB_SUFFIX}",
            self.location,
            crate::wire::content_path(&self.hash)
        )
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> &'a str {
    if s.len() >= suffix.len() {
        let split = s.len() - suffix.len();
        if s.is_char_boundary(split) && s[split..].eq_ignore_ascii_case(suffix) {
            return &s[..split];
        }
    }
    s
}
