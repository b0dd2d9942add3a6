//! Resumable enumeration filters.

use quarry_core::{ContentLocationEntry, ShortHash};
use std::fmt;
use std::sync::Arc;

/// Predicate over the serialized form of an entry.
pub type SerializedEntryPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Cursor plus optional predicate for entry enumeration.
///
/// The predicate sees the serialized entry bytes exactly as the backend
/// stores them, so it can reject entries without decoding. Use
/// [`EnumerationFilter::matching_entries`] to filter on decoded entries.
#[derive(Clone, Default)]
pub struct EnumerationFilter {
    /// First key (inclusive) to enumerate from.
    pub starting_point: Option<ShortHash>,
    predicate: Option<SerializedEntryPredicate>,
}

impl EnumerationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(mut self, hash: ShortHash) -> Self {
        self.starting_point = Some(hash);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Filter on decoded entries. Entries that fail to decode are skipped.
    pub fn matching_entries(
        self,
        predicate: impl Fn(&ContentLocationEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_predicate(move |bytes| {
            ContentLocationEntry::from_bytes(bytes).is_ok_and(|entry| predicate(&entry))
        })
    }

    pub fn start(&self) -> ShortHash {
        self.starting_point.unwrap_or(ShortHash::MIN)
    }

    pub fn should_enumerate(&self, serialized: &[u8]) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(serialized))
    }
}

impl fmt::Debug for EnumerationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumerationFilter")
            .field("starting_point", &self.starting_point)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}
