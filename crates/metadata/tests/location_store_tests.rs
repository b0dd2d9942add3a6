//! Integration tests for the content location database over both backends.

mod common;

use common::{TestDatabase, short_hash, sorted_hashes, write_back};
use futures::{StreamExt, TryStreamExt};
use quarry_core::{ContentLocationEntry, MachineId, MachineLocation};
use quarry_metadata::{
    ClusterState, ContentLocationDatabase, EnumerationFilter, GcOutcome, MemoryStore,
    MetadataError,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

async fn both() -> Vec<TestDatabase> {
    vec![TestDatabase::memory().await, TestDatabase::sqlite().await]
}

fn entry(machines: &[u32], size: i64) -> ContentLocationEntry {
    ContentLocationEntry::new(
        machines.iter().map(|m| MachineId::new(*m)),
        size,
        OffsetDateTime::now_utc(),
    )
}

#[tokio::test]
async fn test_unknown_hash_is_missing() {
    for db in both().await {
        let found = db.database.try_get_entry(&short_hash("never")).await.unwrap();
        assert!(found.is_none(), "{} backend", db.database.backend_name());
    }
}

#[tokio::test]
async fn test_persist_then_get_preserves_locations_and_size() {
    for db in both().await {
        let hash = short_hash("a");
        let stale = OffsetDateTime::now_utc() - Duration::days(3);
        let written = ContentLocationEntry::new([MachineId::new(1), MachineId::new(4)], 1234, stale);
        db.database.persist(&hash, &written).await.unwrap();

        let before_read = OffsetDateTime::now_utc();
        let read = db.database.try_get_entry(&hash).await.unwrap().unwrap();
        assert_eq!(read.locations, written.locations);
        assert_eq!(read.content_size, 1234);
        assert!(read.last_access_time_utc >= before_read);

        // Reading does not write the refreshed time back.
        let listed: Vec<_> = db
            .database
            .enumerate_entries_with_sorted_keys(CancellationToken::new(), None)
            .try_collect()
            .await
            .unwrap();
        assert!(listed[0].1.last_access_time_utc < before_read);
    }
}

#[tokio::test]
async fn test_persist_replaces_rather_than_merges() {
    for db in both().await {
        let hash = short_hash("lww");
        db.database.persist(&hash, &entry(&[1, 2], 5)).await.unwrap();
        db.database.persist(&hash, &entry(&[3], 5)).await.unwrap();
        let read = db.database.try_get_entry(&hash).await.unwrap().unwrap();
        assert_eq!(read.locations, [MachineId::new(3)].into());
    }
}

#[tokio::test]
async fn test_operations_require_initialize() {
    let database =
        ContentLocationDatabase::new(Arc::new(MemoryStore::new()), Default::default());
    let err = database.try_get_entry(&short_hash("x")).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotInitialized));

    database.initialize().await.unwrap();
    database.initialize().await.unwrap();
    assert!(database.try_get_entry(&short_hash("x")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_add_and_remove_location_helpers() {
    for db in both().await {
        let hash = short_hash("helpers");
        db.database.add_location(&hash, MachineId::new(1), 10).await.unwrap();
        let added = db.database.add_location(&hash, MachineId::new(2), 10).await.unwrap();
        assert_eq!(added.locations.len(), 2);

        let removed = db
            .database
            .remove_location(&hash, MachineId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed.locations, [MachineId::new(2)].into());
        assert!(
            db.database
                .remove_location(&short_hash("absent"), MachineId::new(1))
                .await
                .unwrap()
                .is_none()
        );
    }
}

#[tokio::test]
async fn test_sorted_keys_are_strictly_ascending_across_pages() {
    for db in [
        TestDatabase::memory_with(|c| c.enumeration_page_size = 3).await,
        TestDatabase::sqlite_with(|c| c.enumeration_page_size = 3).await,
    ] {
        for i in 0..10 {
            db.database
                .persist(&short_hash(&format!("k{i}")), &entry(&[1], i))
                .await
                .unwrap();
        }
        // Overwrite a few keys; enumeration must not duplicate them.
        for i in 0..3 {
            db.database
                .persist(&short_hash(&format!("k{i}")), &entry(&[2], i))
                .await
                .unwrap();
        }

        let keys: Vec<_> = db
            .database
            .enumerate_sorted_keys(CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 10);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn test_enumeration_resumes_at_cursor() {
    for db in both().await {
        let hashes = sorted_hashes(&["h-one", "h-two", "h-three"]);
        for hash in &hashes {
            db.database.persist(hash, &entry(&[1], 1)).await.unwrap();
        }

        let filter = EnumerationFilter::new().starting_at(hashes[1]);
        let seen: Vec<_> = db
            .database
            .enumerate_entries_with_sorted_keys(CancellationToken::new(), Some(filter))
            .map_ok(|(hash, _)| hash)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seen, vec![hashes[1], hashes[2]]);
    }
}

#[tokio::test]
async fn test_enumeration_predicate_filters_entries() {
    for db in both().await {
        db.database.persist(&short_hash("small"), &entry(&[1], 1)).await.unwrap();
        db.database.persist(&short_hash("large"), &entry(&[1], 1_000_000)).await.unwrap();

        let filter = EnumerationFilter::new().matching_entries(|e| e.content_size > 1000);
        let seen: Vec<_> = db
            .database
            .enumerate_entries_with_sorted_keys(CancellationToken::new(), Some(filter))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, short_hash("large"));
    }
}

#[tokio::test]
async fn test_cancelled_enumeration_ends_with_error() {
    let db = TestDatabase::memory().await;
    db.database.persist(&short_hash("c"), &entry(&[1], 1)).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let mut stream = db.database.enumerate_sorted_keys(token);
    let first = stream.next().await.unwrap();
    assert!(matches!(first, Err(MetadataError::Cancelled)));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_write_back_cache_serves_reads_and_flushes_for_enumeration() {
    for db in [
        TestDatabase::memory_with(write_back).await,
        TestDatabase::sqlite_with(write_back).await,
    ] {
        for i in 0..5 {
            db.database
                .persist(&short_hash(&format!("wb{i}")), &entry(&[1], i))
                .await
                .unwrap();
        }
        db.database.delete(&short_hash("wb0")).await.unwrap();
        assert!(db.database.try_get_entry(&short_hash("wb0")).await.unwrap().is_none());
        assert!(db.database.try_get_entry(&short_hash("wb1")).await.unwrap().is_some());
        assert_eq!(db.database.counters().get("cache_pending"), Some(5));

        let keys: Vec<_> = db
            .database
            .enumerate_sorted_keys(CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 4);
        assert_eq!(db.database.counters().get("cache_pending"), Some(0));
    }
}

#[tokio::test]
async fn test_global_entries_none_deletes() {
    for db in both().await {
        db.database.set_global_entry("k", Some("v")).await.unwrap();
        assert_eq!(
            db.database.get_global_entry("k").await.unwrap().as_deref(),
            Some("v")
        );
        db.database.set_global_entry("k", None).await.unwrap();
        assert!(db.database.get_global_entry("k").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_cluster_state_round_trips_within_epoch() {
    for db in both().await {
        let original = ClusterState::new("epoch-1");
        let a = original.register_machine(&"a:7089".parse::<MachineLocation>().unwrap());
        let b = original.register_machine(&"b:7089".parse::<MachineLocation>().unwrap());
        db.database.update_cluster_state(&original, true).await.unwrap();

        let hydrated = ClusterState::new("epoch-1");
        db.database.update_cluster_state(&hydrated, false).await.unwrap();
        assert_eq!(hydrated.resolve(a), original.resolve(a));
        assert_eq!(hydrated.resolve(b), original.resolve(b));
    }
}

#[tokio::test]
async fn test_cluster_state_from_other_epoch_is_not_loaded() {
    let db = TestDatabase::sqlite().await;
    let original = ClusterState::new("epoch-1");
    original.register_machine(&"a:7089".parse().unwrap());
    db.database.update_cluster_state(&original, true).await.unwrap();

    let next_epoch = ClusterState::new("epoch-2");
    db.database.update_cluster_state(&next_epoch, false).await.unwrap();
    assert!(next_epoch.machines().is_empty());
}

#[tokio::test]
async fn test_cluster_state_persistence_can_be_disabled() {
    let db = TestDatabase::memory_with(|c| c.store_cluster_state = false).await;
    let original = ClusterState::new("e");
    original.register_machine(&"a:1".parse().unwrap());
    db.database.update_cluster_state(&original, true).await.unwrap();

    let hydrated = ClusterState::new("e");
    db.database.update_cluster_state(&hydrated, false).await.unwrap();
    assert!(hydrated.machines().is_empty());
}

#[tokio::test]
async fn test_gc_spares_recent_entries_and_strips_inactive_machines() {
    for db in both().await {
        let cluster = ClusterState::new("e");
        cluster.mark_inactive(MachineId::new(2));
        cluster.mark_inactive(MachineId::new(3));

        let stale = OffsetDateTime::now_utc() - Duration::hours(2);
        let stale_entry = |machines: &[u32]| {
            ContentLocationEntry::new(machines.iter().map(|m| MachineId::new(*m)), 1, stale)
        };

        db.database.persist(&short_hash("recent"), &entry(&[2], 1)).await.unwrap();
        db.database.persist(&short_hash("dead"), &stale_entry(&[2, 3])).await.unwrap();
        db.database.persist(&short_hash("mixed"), &stale_entry(&[1, 2])).await.unwrap();
        db.database.persist(&short_hash("healthy"), &stale_entry(&[1])).await.unwrap();

        let outcome = db.database.garbage_collect(&cluster).await.unwrap();
        let GcOutcome::Completed(stats) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(stats.entries_scanned, 4);
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.entries_cleaned, 1);

        let recent = db.database.try_get_entry(&short_hash("recent")).await.unwrap();
        assert_eq!(recent.unwrap().locations, [MachineId::new(2)].into());
        assert!(db.database.try_get_entry(&short_hash("dead")).await.unwrap().is_none());
        let mixed = db.database.try_get_entry(&short_hash("mixed")).await.unwrap().unwrap();
        assert_eq!(mixed.locations, [MachineId::new(1)].into());
        assert!(db.database.try_get_entry(&short_hash("healthy")).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_gc_retention_removes_old_entries() {
    let db = TestDatabase::sqlite_with(|c| c.content_retention_secs = Some(3600)).await;
    let old = ContentLocationEntry::new(
        [MachineId::new(1)],
        1,
        OffsetDateTime::now_utc() - Duration::hours(5),
    );
    db.database.persist(&short_hash("old"), &old).await.unwrap();
    db.database.persist(&short_hash("new"), &entry(&[1], 1)).await.unwrap();

    let outcome = db.database.garbage_collect(&ClusterState::new("e")).await.unwrap();
    assert!(matches!(outcome, GcOutcome::Completed(s) if s.entries_removed == 1));
    assert!(db.database.try_get_entry(&short_hash("old")).await.unwrap().is_none());
    assert!(db.database.try_get_entry(&short_hash("new")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_gc_with_metadata_enabled_on_memory_backend_skips_records() {
    let db = TestDatabase::memory_with(|c| c.metadata_garbage_collection_enabled = true).await;
    let outcome = db.database.garbage_collect(&ClusterState::new("e")).await.unwrap();
    assert!(matches!(outcome, GcOutcome::Completed(s) if s.metadata_removed == 0));
    assert_eq!(db.database.counters().get("gc_runs"), Some(1));
}

#[tokio::test]
async fn test_sqlite_checkpoint_save_and_restore() {
    let db = TestDatabase::sqlite_with(write_back).await;
    let checkpoint_dir = db.path().join("checkpoint");

    db.database.persist(&short_hash("before"), &entry(&[1], 1)).await.unwrap();
    db.database.set_global_entry("marker", Some("one")).await.unwrap();
    db.database.save_checkpoint(&checkpoint_dir).await.unwrap();

    let published = checkpoint_dir.join("locations.db");
    assert!(published.exists());
    assert!(db.database.is_immutable(&published));
    assert!(!db.database.is_immutable(&checkpoint_dir.join("locations.db-wal")));
    // The live database has the same file name but is not sealed.
    assert!(!db.database.is_immutable(&db.path().join("locations.db")));
    assert!(!db.database.is_immutable(&db.path().join("checkpoint/../locations.db")));

    db.database.persist(&short_hash("after"), &entry(&[1], 1)).await.unwrap();
    db.database.set_global_entry("marker", Some("two")).await.unwrap();

    db.database.restore_checkpoint(&checkpoint_dir).await.unwrap();
    assert!(db.database.try_get_entry(&short_hash("before")).await.unwrap().is_some());
    assert!(db.database.try_get_entry(&short_hash("after")).await.unwrap().is_none());
    assert_eq!(
        db.database.get_global_entry("marker").await.unwrap().as_deref(),
        Some("one")
    );
}

#[tokio::test]
async fn test_restore_from_missing_checkpoint_fails_without_changes() {
    let db = TestDatabase::sqlite().await;
    db.database.persist(&short_hash("keep"), &entry(&[1], 1)).await.unwrap();

    let err = db
        .database
        .restore_checkpoint(&db.path().join("nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
    assert!(db.database.try_get_entry(&short_hash("keep")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_memory_checkpoint_is_a_no_op() {
    let db = TestDatabase::memory().await;
    db.database.save_checkpoint(db.path()).await.unwrap();
    db.database.restore_checkpoint(db.path()).await.unwrap();
    assert!(!db.database.is_immutable(&db.path().join("locations.db")));
}
