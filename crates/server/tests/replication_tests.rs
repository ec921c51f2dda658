//! Integration tests for the replication connection multiplexer.

mod common;

use common::{TestEngine, eventually, sample_files, vault_key};
use pinfold_archive::ReplicateOptions;
use pinfold_core::{FlockIntent, VaultKey};
use pinfold_server::engine::ConnectionEvent;
use pinfold_server::metrics::FLOCK_FALLBACK;
use std::time::Duration;

async fn wait_for_streams(t: &TestEngine, key: &VaultKey, count: usize) {
    let engine = t.engine.clone();
    let key = *key;
    eventually("stream count", move || {
        let engine = engine.clone();
        async move {
            engine
                .get_vault(&key)
                .is_some_and(|handle| handle.num_streams() == count)
        }
    })
    .await;
}

#[tokio::test]
async fn peer_request_attaches_a_live_stream() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(1);
    t.opener.publish(&key, sample_files(1, 2));
    t.host("alice", &key).await;
    let _multiplexer = t.engine.start_multiplexer();

    let mut peer = t.swarm.dial("peer-1");
    assert_eq!(
        peer.read_greeting().await.unwrap(),
        Some(hex::encode(t.engine.network_id()))
    );
    peer.request(&key.discovery_key()).await.unwrap();
    wait_for_streams(&t, &key, 1).await;

    let attachments = t.archive(&key).attachments();
    assert_eq!(attachments.len(), 1);
    assert_eq!(
        attachments[0].options,
        ReplicateOptions {
            upload: true,
            download: true,
            live: true,
        }
    );

    peer.hang_up().await.unwrap();
    wait_for_streams(&t, &key, 0).await;
}

#[tokio::test]
async fn one_connection_multiplexes_several_vaults() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let (first, second) = (vault_key(2), vault_key(3));
    t.host("alice", &first).await;
    t.host("alice", &second).await;
    let _multiplexer = t.engine.start_multiplexer();

    let mut peer = t.swarm.dial("peer-2");
    peer.request(&first.discovery_key()).await.unwrap();
    peer.request(&first.discovery_key()).await.unwrap();
    peer.request(&second.discovery_key()).await.unwrap();
    wait_for_streams(&t, &second, 1).await;

    // Requests are handled in order, so the duplicate was seen already.
    assert_eq!(t.archive(&first).attachments().len(), 1);
    assert_eq!(t.engine.get_vault(&first).unwrap().num_streams(), 1);
    let stream_id = t.archive(&first).attachments()[0].stream.id();
    assert_eq!(t.archive(&second).attachments()[0].stream.id(), stream_id);
}

#[tokio::test]
async fn requests_for_vaults_not_served_are_ignored() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(4);
    t.host("alice", &key).await;
    let _multiplexer = t.engine.start_multiplexer();
    let mut events = t.engine.subscribe_connections();

    let mut peer = t.swarm.dial("peer-3");
    peer.request(&vault_key(99).discovery_key()).await.unwrap();
    peer.request(&key.discovery_key()).await.unwrap();
    wait_for_streams(&t, &key, 1).await;

    match events.recv().await.unwrap() {
        ConnectionEvent::Opened { peer, .. } => assert_eq!(peer.id, "peer-3"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn stream_direction_follows_the_flock_intent() {
    let t = TestEngine::new().await;
    let key = vault_key(5);
    let handle = t.engine.load_vault(&key).await.unwrap();
    let seed_only = FlockIntent {
        upload: true,
        download: false,
    };
    t.engine.set_flock_intent(&handle, seed_only).await.unwrap();
    let _multiplexer = t.engine.start_multiplexer();

    let mut peer = t.swarm.dial("peer-4");
    peer.request(&key.discovery_key()).await.unwrap();
    wait_for_streams(&t, &key, 1).await;

    let options = t.archive(&key).attachments()[0].options;
    assert!(options.upload);
    assert!(!options.download);
}

#[tokio::test]
async fn missing_flock_intent_falls_back_to_full_replication() {
    let t = TestEngine::new().await;
    let key = vault_key(6);
    // Loaded but never flocked: no intent is recorded.
    let handle = t.engine.load_vault(&key).await.unwrap();
    assert_eq!(handle.flock_intent(), None);
    let fallbacks = FLOCK_FALLBACK.get();
    let _multiplexer = t.engine.start_multiplexer();

    let mut peer = t.swarm.dial("peer-5");
    peer.request(&key.discovery_key()).await.unwrap();
    wait_for_streams(&t, &key, 1).await;

    let options = t.archive(&key).attachments()[0].options;
    assert!(options.upload);
    assert!(options.download);
    assert!(FLOCK_FALLBACK.get() > fallbacks);
}

#[tokio::test]
async fn flock_change_destroys_attached_streams() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(7);
    t.host("alice", &key).await;
    let _multiplexer = t.engine.start_multiplexer();

    let mut peer = t.swarm.dial("peer-6");
    peer.request(&key.discovery_key()).await.unwrap();
    wait_for_streams(&t, &key, 1).await;

    let handle = t.engine.get_vault(&key).unwrap();
    t.engine
        .set_flock_intent(&handle, FlockIntent::DORMANT)
        .await
        .unwrap();
    assert_eq!(handle.num_streams(), 0);

    tokio::time::timeout(Duration::from_secs(5), peer.wait_closed())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn protocol_errors_are_reported_then_closed() {
    let t = TestEngine::new().await;
    let _multiplexer = t.engine.start_multiplexer();
    let mut events = t.engine.subscribe_connections();

    let mut peer = t.swarm.dial("peer-7");
    peer.send_line("gossip").await.unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            let closed = matches!(event, ConnectionEvent::Closed { .. });
            seen.push(event);
            if closed {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], ConnectionEvent::Opened { .. }));
    assert!(
        matches!(&seen[1], ConnectionEvent::Errored { message, .. } if message.contains("gossip"))
    );
    assert!(matches!(seen[2], ConnectionEvent::Closed { .. }));
}

#[tokio::test]
async fn multiplexer_stops_at_shutdown() {
    let t = TestEngine::new().await;
    let multiplexer = t.engine.start_multiplexer();

    t.engine.shutdown();
    tokio::time::timeout(Duration::from_secs(5), multiplexer)
        .await
        .unwrap()
        .unwrap();
    assert!(t.engine.is_shut_down());
}
