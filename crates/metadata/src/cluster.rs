//! Cluster state: machine id assignment, location resolution and liveness.

use quarry_core::{MachineId, MachineLocation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Persisted binding of a machine id to its location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub location: MachineLocation,
}

/// External liveness feed. Returns the machines currently considered inactive.
pub type InactiveMachinesFeed = Arc<dyn Fn() -> Vec<MachineId> + Send + Sync>;

#[derive(Default)]
struct Machines {
    by_id: BTreeMap<MachineId, MachineLocation>,
    by_location: HashMap<MachineLocation, MachineId>,
    next_id: u32,
    inactive_overrides: BTreeSet<MachineId>,
    local: Option<MachineId>,
}

/// Process-wide view of cluster membership for one epoch.
///
/// Ids are assigned from 1 upward and are never reused within an epoch. The
/// tracker never touches location entries; the location database asks it
/// which machines are inactive during GC.
pub struct ClusterState {
    epoch: String,
    machines: RwLock<Machines>,
    inactive_feed: Option<InactiveMachinesFeed>,
}

impl ClusterState {
    pub fn new(epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
            machines: RwLock::new(Machines {
                next_id: 1,
                ..Machines::default()
            }),
            inactive_feed: None,
        }
    }

    /// Attach the external liveness feed.
    pub fn with_inactive_feed(mut self, feed: InactiveMachinesFeed) -> Self {
        self.inactive_feed = Some(feed);
        self
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    fn read(&self) -> RwLockReadGuard<'_, Machines> {
        self.machines.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Machines> {
        self.machines.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the id bound to `location`, assigning the next free id if the
    /// location is new.
    pub fn register_machine(&self, location: &MachineLocation) -> MachineId {
        let mut machines = self.write();
        if let Some(id) = machines.by_location.get(location) {
            return *id;
        }
        let id = MachineId::new(machines.next_id);
        machines.next_id += 1;
        machines.by_id.insert(id, location.clone());
        machines.by_location.insert(location.clone(), id);
        debug!(machine = %id, location = %location, "registered machine");
        id
    }

    /// Register `location` and remember it as this process's own machine.
    pub fn register_local_machine(&self, location: &MachineLocation) -> MachineId {
        let id = self.register_machine(location);
        self.write().local = Some(id);
        id
    }

    pub fn local_machine(&self) -> Option<MachineId> {
        self.read().local
    }

    pub fn resolve(&self, id: MachineId) -> Option<MachineLocation> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn resolve_id(&self, location: &MachineLocation) -> Option<MachineId> {
        self.read().by_location.get(location).copied()
    }

    pub fn machines(&self) -> Vec<MachineRecord> {
        self.read()
            .by_id
            .iter()
            .map(|(id, location)| MachineRecord {
                id: *id,
                location: location.clone(),
            })
            .collect()
    }

    /// Machines reported inactive by the feed plus operator overrides.
    pub fn inactive_machines(&self) -> BTreeSet<MachineId> {
        let mut inactive = self.read().inactive_overrides.clone();
        if let Some(feed) = &self.inactive_feed {
            inactive.extend(feed());
        }
        inactive
    }

    pub fn is_active(&self, id: MachineId) -> bool {
        !self.inactive_machines().contains(&id)
    }

    pub fn mark_inactive(&self, id: MachineId) {
        self.write().inactive_overrides.insert(id);
    }

    pub fn mark_active(&self, id: MachineId) {
        self.write().inactive_overrides.remove(&id);
    }

    /// Merge persisted records into the in-memory view.
    ///
    /// Existing bindings win over conflicting records; the next assigned id
    /// is kept above every id seen.
    pub fn apply_records(&self, records: &[MachineRecord]) {
        let mut machines = self.write();
        for record in records {
            let id_taken = machines
                .by_id
                .get(&record.id)
                .is_some_and(|loc| *loc != record.location);
            let location_taken = machines
                .by_location
                .get(&record.location)
                .is_some_and(|id| *id != record.id);
            if id_taken || location_taken {
                warn!(
                    machine = %record.id,
                    location = %record.location,
                    "ignoring persisted machine record that conflicts with a live binding"
                );
                continue;
            }
            machines.by_id.insert(record.id, record.location.clone());
            machines.by_location.insert(record.location.clone(), record.id);
            if record.id.as_u32() >= machines.next_id {
                machines.next_id = record.id.as_u32() + 1;
            }
        }
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machines = self.read();
        f.debug_struct("ClusterState")
            .field("epoch", &self.epoch)
            .field("machines", &machines.by_id.len())
            .field("local", &machines.local)
            .finish()
    }
}
