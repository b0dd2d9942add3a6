//! Content location entries.

use crate::machine::MachineId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::{Duration, OffsetDateTime};

/// Which machines hold a piece of content, plus size and access bookkeeping.
///
/// Entries are value snapshots. Every mutation returns a new entry; stores
/// hand out freshly deserialized copies, so readers never observe a torn
/// update. "No known location" is modelled as `Option::None` by the stores,
/// while an entry with an empty set means the content is known but has no
/// remote copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocationEntry {
    pub locations: BTreeSet<MachineId>,
    pub content_size: i64,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub creation_time_utc: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_access_time_utc: OffsetDateTime,
}

impl ContentLocationEntry {
    pub fn new(
        locations: impl IntoIterator<Item = MachineId>,
        content_size: i64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            locations: locations.into_iter().collect(),
            content_size,
            creation_time_utc: Some(now),
            last_access_time_utc: now,
        }
    }

    pub fn with_location(&self, machine: MachineId, now: OffsetDateTime) -> Self {
        let mut next = self.touched(now);
        next.locations.insert(machine);
        next
    }

    pub fn without_location(&self, machine: MachineId, now: OffsetDateTime) -> Self {
        let mut next = self.touched(now);
        next.locations.remove(&machine);
        next
    }

    /// Copy with `last_access_time_utc` moved forward to `now`.
    ///
    /// Access time never moves backwards.
    pub fn touched(&self, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        if now > next.last_access_time_utc {
            next.last_access_time_utc = now;
        }
        next
    }

    /// Copy with the given machines removed from the location set.
    pub fn without_machines(&self, machines: &BTreeSet<MachineId>) -> Self {
        let mut next = self.clone();
        next.locations.retain(|m| !machines.contains(m));
        next
    }

    pub fn has_location(&self, machine: MachineId) -> bool {
        self.locations.contains(&machine)
    }

    /// True when the entry was accessed less than `window` before `now`.
    pub fn accessed_within(&self, now: OffsetDateTime, window: Duration) -> bool {
        now - self.last_access_time_utc < window
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
