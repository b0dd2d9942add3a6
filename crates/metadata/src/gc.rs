//! Garbage collection of location entries and memoization records.

use crate::cluster::ClusterState;
use crate::database::ContentLocationDatabase;
use crate::error::MetadataResult;
use crate::repos::EntryUpdate;
use quarry_core::{ContentLocationEntry, ShortHash};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Counts from one GC pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub entries_scanned: u64,
    /// Entries deleted (all locations inactive, or past retention).
    pub entries_removed: u64,
    /// Entries rewritten without their inactive locations.
    pub entries_cleaned: u64,
    /// Memoization records deleted.
    pub metadata_removed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcOutcome {
    Completed(GcStats),
    /// Another pass was in flight; nothing was done.
    AlreadyRunning,
}

/// Clears the in-flight flag on every exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Verdict {
    Keep,
    Rewrite(ContentLocationEntry),
    Remove,
}

impl ContentLocationDatabase {
    /// Run one GC pass over location entries and, when enabled, memoization
    /// records. Not re-entrant: a concurrent call returns
    /// [`GcOutcome::AlreadyRunning`].
    ///
    /// Entries accessed within the GC interval are never modified.
    #[instrument(skip(self, cluster), fields(backend = self.backend_name()))]
    pub async fn garbage_collect(&self, cluster: &ClusterState) -> MetadataResult<GcOutcome> {
        self.ensure_initialized()?;
        if self
            .gc_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("garbage collection already in progress");
            return Ok(GcOutcome::AlreadyRunning);
        }
        let _running = RunningGuard(&self.gc_running);

        let now = OffsetDateTime::now_utc();
        let mut stats = self.collect_content(cluster, now).await?;
        if self.config.metadata_garbage_collection_enabled {
            stats.metadata_removed = match self.collect_metadata(now).await {
                Ok(removed) => removed,
                Err(e) if e.is_unsupported() => {
                    debug!(error = %e, "skipping memoization GC");
                    0
                }
                Err(e) => return Err(e),
            };
        }

        self.record_gc_run();
        info!(
            scanned = stats.entries_scanned,
            removed = stats.entries_removed,
            cleaned = stats.entries_cleaned,
            metadata_removed = stats.metadata_removed,
            "garbage collection complete"
        );
        Ok(GcOutcome::Completed(stats))
    }

    /// Trim memoization records to `maximum_number_of_entries_to_keep`,
    /// most recently used first. Returns how many were removed.
    pub async fn garbage_collect_metadata(&self) -> MetadataResult<u64> {
        self.ensure_initialized()?;
        self.collect_metadata(OffsetDateTime::now_utc()).await
    }

    async fn collect_metadata(&self, now: OffsetDateTime) -> MetadataResult<u64> {
        let protect_after = now - self.config.garbage_collection_interval();
        self.backend
            .delete_least_recently_used(self.config.maximum_number_of_entries_to_keep, protect_after)
            .await
    }

    async fn collect_content(
        &self,
        cluster: &ClusterState,
        now: OffsetDateTime,
    ) -> MetadataResult<GcStats> {
        self.flush().await?;

        let inactive = cluster.inactive_machines();
        let interval = self.config.garbage_collection_interval();
        let retention = self.config.content_retention();
        let page_size = self.config.enumeration_page_size.max(1);
        let mut stats = GcStats::default();

        let mut cursor = Some(ShortHash::MIN);
        while let Some(start) = cursor {
            let page = self.backend.scan_entries(&start, page_size).await?;
            cursor = if page.len() < page_size {
                None
            } else {
                page.last().and_then(|(hash, _)| hash.successor())
            };

            let mut updates: Vec<EntryUpdate> = Vec::new();
            for (hash, bytes) in page {
                stats.entries_scanned += 1;
                let entry = match ContentLocationEntry::from_bytes(&bytes) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(hash = %hash, error = %e, "removing undecodable location entry");
                        updates.push((hash, None));
                        stats.entries_removed += 1;
                        continue;
                    }
                };

                match judge(&entry, &inactive, now, interval, retention) {
                    Verdict::Keep => {}
                    Verdict::Remove => {
                        updates.push((hash, None));
                        stats.entries_removed += 1;
                    }
                    Verdict::Rewrite(cleaned) => {
                        updates.push((hash, Some(cleaned.to_bytes()?)));
                        stats.entries_cleaned += 1;
                    }
                }
            }
            self.apply_updates(updates).await?;
        }

        self.flush().await?;
        Ok(stats)
    }
}

fn judge(
    entry: &ContentLocationEntry,
    inactive: &std::collections::BTreeSet<quarry_core::MachineId>,
    now: OffsetDateTime,
    interval: time::Duration,
    retention: Option<time::Duration>,
) -> Verdict {
    if entry.accessed_within(now, interval) {
        return Verdict::Keep;
    }
    if let Some(retention) = retention
        && !entry.accessed_within(now, retention)
    {
        return Verdict::Remove;
    }
    let cleaned = entry.without_machines(inactive);
    if cleaned.locations.len() == entry.locations.len() {
        Verdict::Keep
    } else if cleaned.locations.is_empty() {
        Verdict::Remove
    } else {
        Verdict::Rewrite(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::MachineId;
    use std::collections::BTreeSet;
    use time::Duration;

    fn at(minutes_ago: i64, now: OffsetDateTime, machines: &[u32]) -> ContentLocationEntry {
        ContentLocationEntry::new(
            machines.iter().map(|m| MachineId::new(*m)),
            10,
            now - Duration::minutes(minutes_ago),
        )
    }

    #[test]
    fn test_recent_entries_are_kept_even_if_all_inactive() {
        let now = OffsetDateTime::now_utc();
        let inactive: BTreeSet<_> = [MachineId::new(1)].into();
        let verdict = judge(&at(5, now, &[1]), &inactive, now, Duration::minutes(30), None);
        assert!(matches!(verdict, Verdict::Keep));
    }

    #[test]
    fn test_stale_entry_with_only_inactive_locations_is_removed() {
        let now = OffsetDateTime::now_utc();
        let inactive: BTreeSet<_> = [MachineId::new(1), MachineId::new(2)].into();
        let verdict = judge(&at(60, now, &[1, 2]), &inactive, now, Duration::minutes(30), None);
        assert!(matches!(verdict, Verdict::Remove));
    }

    #[test]
    fn test_stale_entry_is_stripped_of_inactive_locations() {
        let now = OffsetDateTime::now_utc();
        let inactive: BTreeSet<_> = [MachineId::new(2)].into();
        match judge(&at(60, now, &[1, 2]), &inactive, now, Duration::minutes(30), None) {
            Verdict::Rewrite(cleaned) => {
                assert_eq!(cleaned.locations, [MachineId::new(1)].into());
            }
            _ => panic!("expected rewrite"),
        }
    }

    #[test]
    fn test_retention_removes_old_entries() {
        let now = OffsetDateTime::now_utc();
        let verdict = judge(
            &at(180, now, &[1]),
            &BTreeSet::new(),
            now,
            Duration::minutes(30),
            Some(Duration::minutes(120)),
        );
        assert!(matches!(verdict, Verdict::Remove));
    }

    #[test]
    fn test_locally_known_entry_without_locations_is_kept() {
        let now = OffsetDateTime::now_utc();
        let verdict = judge(&at(60, now, &[]), &BTreeSet::new(), now, Duration::minutes(30), None);
        assert!(matches!(verdict, Verdict::Keep));
    }
}
