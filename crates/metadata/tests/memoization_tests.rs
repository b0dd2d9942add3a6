//! Compare-exchange and memoization record tests (SQLite backend).

mod common;

use common::{TestDatabase, record, strong_fingerprint};
use futures::TryStreamExt;
use quarry_core::config::{LocationBackendConfig, LocationStoreConfig};
use quarry_core::{
    CacheDeterminism, ContentHash, ContentHashListWithDeterminism, Fingerprint, Selector,
    StrongFingerprint,
};
use quarry_metadata::{ClusterState, GcOutcome, MetadataError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_compare_exchange_from_missing_succeeds_once_under_race() {
    let db = TestDatabase::sqlite().await;
    let strong = strong_fingerprint("race");

    let mut handles = Vec::new();
    for i in 0..16 {
        let database = Arc::clone(&db.database);
        let strong = strong.clone();
        handles.push(tokio::spawn(async move {
            let replacement = record(&format!("candidate-{i}"), CacheDeterminism::None);
            let applied = database
                .compare_exchange(
                    &strong,
                    &ContentHashListWithDeterminism::missing(),
                    &replacement,
                )
                .await
                .unwrap();
            (applied, replacement)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (applied, replacement) = handle.await.unwrap();
        if applied {
            winners.push(replacement);
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = db.database.get_content_hash_list(&strong).await.unwrap().unwrap();
    assert_eq!(stored, winners[0]);
}

#[tokio::test]
async fn test_compare_exchange_requires_matching_expected_value() {
    let db = TestDatabase::sqlite().await;
    let strong = strong_fingerprint("cas");
    let first = record("first", CacheDeterminism::None);
    let second = record("second", CacheDeterminism::Tool);
    let stranger = record("stranger", CacheDeterminism::None);

    assert!(
        db.database
            .compare_exchange(&strong, &ContentHashListWithDeterminism::missing(), &first)
            .await
            .unwrap()
    );
    // Wrong expectation: not applied.
    assert!(
        !db.database
            .compare_exchange(&strong, &stranger, &second)
            .await
            .unwrap()
    );
    // Expecting absence when a value exists: not applied.
    assert!(
        !db.database
            .compare_exchange(&strong, &ContentHashListWithDeterminism::missing(), &second)
            .await
            .unwrap()
    );
    assert!(
        db.database
            .compare_exchange(&strong, &first, &second)
            .await
            .unwrap()
    );
    assert_eq!(
        db.database.get_content_hash_list(&strong).await.unwrap(),
        Some(second)
    );
}

#[tokio::test]
async fn test_compare_exchange_compares_determinism() {
    let db = TestDatabase::sqlite().await;
    let strong = strong_fingerprint("cas-determinism");
    let flaky = record("same", CacheDeterminism::None);
    let pinned = record("same", CacheDeterminism::Tool);
    let other = record("other", CacheDeterminism::None);

    assert!(
        db.database
            .compare_exchange(&strong, &ContentHashListWithDeterminism::missing(), &flaky)
            .await
            .unwrap()
    );
    assert!(
        db.database
            .compare_exchange(&strong, &flaky, &pinned)
            .await
            .unwrap()
    );

    // Same list, stale determinism: the pinned record stays.
    assert!(
        !db.database
            .compare_exchange(&strong, &flaky, &other)
            .await
            .unwrap()
    );
    assert_eq!(
        db.database.get_content_hash_list(&strong).await.unwrap(),
        Some(pinned)
    );
}

#[tokio::test]
async fn test_get_selectors_and_enumerate_strong_fingerprints() {
    let db = TestDatabase::sqlite_with(|c| c.enumeration_page_size = 2).await;
    let weak = Fingerprint::new(b"weak".to_vec());

    let mut expected = Vec::new();
    for i in 0..5 {
        let selector = Selector::with_output(
            ContentHash::compute_sha256(format!("input-{i}").as_bytes()),
            vec![i],
        );
        let strong = StrongFingerprint::new(weak.clone(), selector.clone());
        db.database
            .compare_exchange(
                &strong,
                &ContentHashListWithDeterminism::missing(),
                &record("out", CacheDeterminism::None),
            )
            .await
            .unwrap();
        expected.push(strong);
    }
    db.database
        .compare_exchange(
            &strong_fingerprint("other"),
            &ContentHashListWithDeterminism::missing(),
            &record("out", CacheDeterminism::None),
        )
        .await
        .unwrap();

    let selectors = db.database.get_selectors(&weak).await.unwrap();
    assert_eq!(selectors.len(), 5);
    for strong in &expected {
        assert!(selectors.contains(&strong.selector));
    }

    let all: Vec<_> = db
        .database
        .enumerate_strong_fingerprints(CancellationToken::new())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 6);
    for strong in &expected {
        assert!(all.contains(strong));
    }
}

#[tokio::test]
async fn test_memoization_on_memory_backend_is_unsupported() {
    let db = TestDatabase::memory().await;
    let err = db
        .database
        .compare_exchange(
            &strong_fingerprint("m"),
            &ContentHashListWithDeterminism::missing(),
            &record("m", CacheDeterminism::None),
        )
        .await
        .unwrap_err();
    assert!(err.is_unsupported());

    let err = db
        .database
        .get_content_hash_list(&strong_fingerprint("m"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Unsupported { backend: "memory", .. }));
}

#[tokio::test]
async fn test_metadata_gc_keeps_most_recent_records() {
    let db = TestDatabase::sqlite_with(|c| {
        c.metadata_garbage_collection_enabled = true;
        c.maximum_number_of_entries_to_keep = 2;
        c.garbage_collection_interval_secs = 1;
    })
    .await;

    for i in 0..5 {
        db.database
            .compare_exchange(
                &strong_fingerprint(&format!("r{i}")),
                &ContentHashListWithDeterminism::missing(),
                &record("out", CacheDeterminism::None),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let outcome = db.database.garbage_collect(&ClusterState::new("e")).await.unwrap();
    assert!(matches!(outcome, GcOutcome::Completed(s) if s.metadata_removed == 3));

    for i in 0..3 {
        let gone = db
            .database
            .get_content_hash_list(&strong_fingerprint(&format!("r{i}")))
            .await
            .unwrap();
        assert!(gone.is_none(), "r{i} should have been collected");
    }
    for i in 3..5 {
        let kept = db
            .database
            .get_content_hash_list(&strong_fingerprint(&format!("r{i}")))
            .await
            .unwrap();
        assert!(kept.is_some(), "r{i} should be kept");
    }
}

#[tokio::test]
async fn test_metadata_gc_spares_records_inside_interval() {
    let db = TestDatabase::sqlite_with(|c| {
        c.maximum_number_of_entries_to_keep = 0;
    })
    .await;
    db.database
        .compare_exchange(
            &strong_fingerprint("fresh"),
            &ContentHashListWithDeterminism::missing(),
            &record("out", CacheDeterminism::None),
        )
        .await
        .unwrap();
    assert_eq!(db.database.garbage_collect_metadata().await.unwrap(), 0);
}

#[tokio::test]
async fn test_corrupt_store_fails_without_retry_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locations.db");
    std::fs::write(&path, vec![0x5a; 8192]).unwrap();

    let config = LocationStoreConfig {
        backend: LocationBackendConfig::Sqlite { path: path.clone() },
        ..LocationStoreConfig::default()
    };
    let err = quarry_metadata::from_config(&config).await.err().unwrap();
    assert!(matches!(err, MetadataError::Corruption(_)), "got {err:?}");
}

#[tokio::test]
async fn test_corrupt_store_is_recreated_with_retry_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locations.db");
    std::fs::write(&path, vec![0x5a; 8192]).unwrap();

    let config = LocationStoreConfig {
        backend: LocationBackendConfig::Sqlite { path: path.clone() },
        on_failure_delete_existing_store_and_retry: true,
        ..LocationStoreConfig::default()
    };
    let database = quarry_metadata::from_config(&config).await.unwrap();
    database.health_check().await.unwrap();
    assert_eq!(
        database.counters().get("persists"),
        Some(0),
        "fresh store expected"
    );
}
