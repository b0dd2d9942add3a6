mod common;

use bytes::Bytes;
use common::{Node, can_bind_localhost, location_of};
use futures::TryStreamExt;
use httpmock::Method::{GET, HEAD, PUT};
use httpmock::MockServer;
use quarry_core::ContentHash;
use quarry_copy::wire::content_path;
use quarry_copy::{CopyError, LocalContent, PushOutcome};
use quarry_storage::{ContentStore, CopyRequestOutcome};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_local_put_registers_this_machine() {
    let node = Node::start().await;
    let put = node.store.put_bytes(Bytes::from_static(b"built")).await.unwrap();

    let entry = node
        .store
        .database()
        .try_get_entry(&put.hash.to_short_hash())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.has_location(node.store.local_machine()));
    assert_eq!(entry.content_size, 5);

    let outcome = node
        .store
        .ensure_local(&put.hash, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, LocalContent::AlreadyLocal);
}

#[tokio::test]
async fn test_ensure_local_copies_from_peer() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let node = Node::start().await;
    let peer = MockServer::start_async().await;
    let hash = ContentHash::compute_sha256(b"remote bytes");
    peer.mock_async(|when, then| {
        when.method(GET).path(content_path(&hash));
        then.status(200).body("remote bytes");
    })
    .await;

    let peer_location = location_of(&peer);
    let peer_id = node.cluster.register_machine(&peer_location);
    node.store
        .database()
        .add_location(&hash.to_short_hash(), peer_id, 12)
        .await
        .unwrap();

    let outcome = node
        .store
        .ensure_local(&hash, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LocalContent::Copied {
            from: peer_location,
            bytes: 12
        }
    );
    assert!(node.store.local().contains(&hash).await.unwrap());

    let entry = node
        .store
        .database()
        .try_get_entry(&hash.to_short_hash())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.has_location(peer_id));
    assert!(entry.has_location(node.store.local_machine()));
    assert_eq!(node.store.stats().get("peer_fetches"), Some(1));
}

#[tokio::test]
async fn test_ensure_local_skips_inactive_peers() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let node = Node::start().await;
    let peer = MockServer::start_async().await;
    let hash = ContentHash::compute_sha256(b"unreachable");
    let get = peer
        .mock_async(|when, then| {
            when.method(GET).path(content_path(&hash));
            then.status(200).body("unreachable");
        })
        .await;

    let peer_id = node.cluster.register_machine(&location_of(&peer));
    node.store
        .database()
        .add_location(&hash.to_short_hash(), peer_id, 11)
        .await
        .unwrap();
    node.cluster.mark_inactive(peer_id);

    let err = node
        .store
        .ensure_local(&hash, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CopyError::ContentNotFound(_)));
    assert_eq!(get.hits_async().await, 0);
}

#[tokio::test]
async fn test_ensure_local_falls_back_after_bad_peer() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let node = Node::start().await;
    let hash = ContentHash::compute_sha256(b"the real thing");

    // The first peer serves corrupted bytes, the second the real content.
    let bad = MockServer::start_async().await;
    bad.mock_async(|when, then| {
        when.method(GET).path(content_path(&hash));
        then.status(200).body("corrupted");
    })
    .await;
    let good = MockServer::start_async().await;
    good.mock_async(|when, then| {
        when.method(GET).path(content_path(&hash));
        then.status(200).body("the real thing");
    })
    .await;

    let bad_id = node.cluster.register_machine(&location_of(&bad));
    let good_id = node.cluster.register_machine(&location_of(&good));
    let database = node.store.database();
    database
        .add_location(&hash.to_short_hash(), bad_id, 14)
        .await
        .unwrap();
    database
        .add_location(&hash.to_short_hash(), good_id, 14)
        .await
        .unwrap();

    let outcome = node
        .store
        .ensure_local(&hash, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LocalContent::Copied {
            from: location_of(&good),
            bytes: 14
        }
    );
    assert_eq!(node.store.stats().get("peer_fetch_failures"), Some(1));
    assert_eq!(node.store.local().stats().get("hash_mismatches"), Some(1));
}

#[tokio::test]
async fn test_copy_request_pulls_from_requester() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let node = Node::start().await;
    let requester = MockServer::start_async().await;
    let hash = ContentHash::compute_sha256(b"pull me");
    let get = requester
        .mock_async(|when, then| {
            when.method(GET).path(content_path(&hash));
            then.status(200).body("pull me");
        })
        .await;

    let handler = node.store.capabilities().copy_request.unwrap();
    let requester_location = location_of(&requester);

    let first = handler
        .handle_copy_request(&hash, &requester_location)
        .await
        .unwrap();
    assert_eq!(first, CopyRequestOutcome::Copied { bytes: 7 });

    let second = handler
        .handle_copy_request(&hash, &requester_location)
        .await
        .unwrap();
    assert_eq!(second, CopyRequestOutcome::AlreadyPresent);
    get.assert_hits_async(1).await;

    let requester_id = node.cluster.resolve_id(&requester_location).unwrap();
    let entry = node
        .store
        .database()
        .try_get_entry(&hash.to_short_hash())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.has_location(requester_id));
    assert!(entry.has_location(node.store.local_machine()));
}

#[tokio::test]
async fn test_push_to_sends_local_content() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let node = Node::start().await;
    let put = node.store.put_bytes(Bytes::from_static(b"replica")).await.unwrap();

    let target = MockServer::start_async().await;
    target
        .mock_async(|when, then| {
            when.method(HEAD).path(content_path(&put.hash));
            then.status(404);
        })
        .await;
    target
        .mock_async(|when, then| {
            when.method(PUT).path(content_path(&put.hash));
            then.status(201);
        })
        .await;

    let outcome = node
        .store
        .push_to(&put.hash, &location_of(&target))
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Pushed { bytes: 7 });
}

#[tokio::test]
async fn test_remove_from_tracker_drops_this_machine() {
    let node = Node::start().await;
    let a = node.store.put_bytes(Bytes::from_static(b"a")).await.unwrap();
    let b = node.store.put_bytes(Bytes::from_static(b"b")).await.unwrap();

    let peer = node
        .cluster
        .register_machine(&"peer:7089".parse().unwrap());
    let foreign = ContentHash::compute_sha256(b"foreign");
    node.store
        .database()
        .add_location(&foreign.to_short_hash(), peer, 7)
        .await
        .unwrap();

    let repair = node.store.capabilities().repair.unwrap();
    assert_eq!(repair.remove_from_tracker().await.unwrap(), 2);

    let database = node.store.database();
    for hash in [&a.hash, &b.hash] {
        let entry = database
            .try_get_entry(&hash.to_short_hash())
            .await
            .unwrap()
            .unwrap();
        assert!(entry.locations.is_empty());
    }
    let foreign_entry = database
        .try_get_entry(&foreign.to_short_hash())
        .await
        .unwrap()
        .unwrap();
    assert!(foreign_entry.has_location(peer));
}

#[tokio::test]
async fn test_session_reads_local_and_reports_missing() {
    let node = Node::start().await;
    let session = node.store.create_session("reader").await.unwrap();

    let put = session.put_bytes(Bytes::from_static(b"local")).await.unwrap();
    let stream = session.open_stream(&put.hash).await.unwrap().unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"local");

    let unknown = ContentHash::compute_sha256(b"nobody has this");
    assert!(session.open_stream(&unknown).await.unwrap().is_none());
    assert_eq!(session.content_size(&unknown).await.unwrap(), None);
}
