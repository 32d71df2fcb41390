// Ingest → moderate → fan-out → batch, driven through the Engine.

use crate::support::{eventually, harness, kick, test_config, twitch, GOOD};
use chorus::engine::hub::HubFrame;
use chorus::engine::orchestrator::Ingested;
use chorus_core::atoms::traits::Delivery;
use chorus_core::{Classification, Platform};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn next_frame(sub: &mut chorus::Subscriber) -> HubFrame {
    loop {
        let frame = tokio::time::timeout(WAIT, sub.recv()).await.expect("timed out").expect("listener removed");
        match frame {
            HubFrame::Ping(seq) => sub.pong(seq),
            other => return other,
        }
    }
}

async fn next_message_id(sub: &mut chorus::Subscriber) -> String {
    let msg = tokio::time::timeout(WAIT, sub.recv_message()).await.expect("timed out").expect("stream closed");
    msg.id.clone()
}

#[tokio::test]
async fn test_quality_messages_reach_subscribers_and_store() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut sub = h.engine.subscribe(&conn.connection_id).unwrap();

    for id in ["a", "b", "c"] {
        match h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await {
            Ingested::Accepted { message, listeners } => {
                assert_eq!(listeners, 1);
                assert_eq!(message.classification, Classification::Quality);
                assert!(message.is_question);
                assert_eq!(message.stream_id, "twitch-abc");
            }
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    assert_eq!(next_message_id(&mut sub).await, "a");
    assert_eq!(next_message_id(&mut sub).await, "b");
    assert_eq!(next_message_id(&mut sub).await, "c");

    assert!(h.engine.settle(WAIT).await);
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 3);
    assert_eq!(h.store.questions("twitch-abc", 10).await.unwrap().len(), 3);
    assert_eq!(h.engine.reputation("alice").reputation, 3);

    let stats = h.engine.stats().await;
    assert_eq!(stats.messages.received, 3);
    assert_eq!(stats.messages.broadcast, 3);
    assert_eq!(stats.messages.questions, 3);
    assert_eq!(stats.persistence.rows_inserted, 3);
}

#[tokio::test]
async fn test_spam_is_dropped_before_fan_out() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut sub = h.engine.subscribe(&conn.connection_id).unwrap();

    match h.engine.ingest(&conn.connection_id, twitch("s1", "bob", "lol lol lol lol")).await {
        Ingested::Spam { identity, reputation } => {
            assert_eq!(identity, "bob");
            assert_eq!(reputation, -1);
        }
        other => panic!("expected spam, got {:?}", other),
    }

    assert!(h.engine.settle(WAIT).await);
    assert!(sub.drain().iter().all(|f| !matches!(f, HubFrame::Message(_))));
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 0);
    assert_eq!(h.engine.stats().await.messages.spam_dropped, 1);
}

#[tokio::test]
async fn test_reputation_is_tracked_per_sender() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();

    h.engine.ingest(&conn.connection_id, twitch("1", "alice", GOOD)).await;
    h.engine.ingest(&conn.connection_id, twitch("2", "bob", "lol lol lol lol")).await;
    h.engine.ingest(&conn.connection_id, twitch("3", "alice", GOOD)).await;

    assert_eq!(h.engine.reputation("alice").reputation, 2);
    assert_eq!(h.engine.reputation("bob").reputation, -1);
    assert_eq!(h.engine.reputation("carol").reputation, 0);

    assert!(h.engine.reset_reputation("bob"));
    assert_eq!(h.engine.reputation("bob").reputation, 0);
}

#[tokio::test]
async fn test_per_stream_order_survives_batching() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut sub = h.engine.subscribe(&conn.connection_id).unwrap();

    let ids: Vec<String> = (0..30).map(|i| format!("m{:02}", i)).collect();
    for id in &ids {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }

    for id in &ids {
        assert_eq!(&next_message_id(&mut sub).await, id);
    }
    assert!(h.engine.settle(WAIT).await);
    let stored: Vec<String> = h.store.in_arrival_order("twitch-abc").await.unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(stored, ids);
}

#[tokio::test]
async fn test_duplicate_and_invalid_events_are_dropped() {
    let h = harness(test_config()).await;
    let twitch_conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let kick_conn = h.engine.connect(Platform::Kick, "somestreamer").unwrap();

    assert!(matches!(
        h.engine.ingest(&twitch_conn.connection_id, twitch("same", "alice", GOOD)).await,
        Ingested::Accepted { .. }
    ));
    assert!(matches!(
        h.engine.ingest(&twitch_conn.connection_id, twitch("same", "alice", GOOD)).await,
        Ingested::Duplicate
    ));
    // Ids are only unique per stream
    assert!(matches!(
        h.engine.ingest(&kick_conn.connection_id, kick("same", "alice", GOOD)).await,
        Ingested::Accepted { .. }
    ));
    assert!(matches!(
        h.engine.ingest(&kick_conn.connection_id, kick("blank", "alice", "   ")).await,
        Ingested::Invalid
    ));

    let stats = h.engine.stats().await;
    assert_eq!(stats.messages.duplicates_dropped, 1);
    assert_eq!(stats.messages.invalid_dropped, 1);
    assert_eq!(h.engine.reputation("alice").reputation, 2);
}

#[tokio::test]
async fn test_same_upstream_id_is_stored_once_per_stream() {
    let mut config = test_config();
    config.batch.size = 1;
    let h = harness(config).await;
    let feed = h.kick.push_live();
    let twitch_conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let kick_conn = h.engine.connect(Platform::Kick, "somestreamer").unwrap();
    let mut kick_sub = h.engine.subscribe(&kick_conn.connection_id).unwrap();

    h.engine.ingest(&twitch_conn.connection_id, twitch("42", "alice", GOOD)).await;
    feed.send(Ok(Delivery::Push(vec![kick("42", "bob", GOOD)]))).unwrap();
    assert_eq!(next_message_id(&mut kick_sub).await, "42");

    // Fan-out happens before the flush, so wait for the row itself
    let stored = eventually(WAIT, || {
        let store = h.store.clone();
        async move { store.count("kick-somestreamer").await.unwrap_or(0) == 1 }
    })
    .await;
    assert!(stored);
    assert!(h.engine.settle(WAIT).await);
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 1);
    assert_eq!(h.engine.stats().await.persistence.duplicates_ignored, 0);
}

#[tokio::test]
async fn test_messages_for_unknown_connection_are_orphaned() {
    let h = harness(test_config()).await;
    assert!(matches!(
        h.engine.ingest("twitch-nobody-1700000000000", twitch("x", "alice", GOOD)).await,
        Ingested::Orphaned
    ));
    assert!(h.engine.subscribe("twitch-nobody-1700000000000").is_err());
    assert_eq!(h.engine.stats().await.messages.orphaned_dropped, 1);
}

#[tokio::test]
async fn test_last_unsubscribe_removes_stream() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let first = h.engine.subscribe(&conn.connection_id).unwrap();
    let second = h.engine.subscribe(&conn.connection_id).unwrap();
    assert_eq!(h.engine.stats().await.hub.listeners, 2);

    assert!(h.engine.unsubscribe(&conn.connection_id, first.id()));
    assert!(!h.engine.unsubscribe(&conn.connection_id, first.id()));
    assert!(h.engine.unsubscribe(&conn.connection_id, second.id()));

    let hub = h.engine.stats().await.hub;
    assert_eq!(hub.listeners, 0);
    assert_eq!(hub.streams, 0);
    match h.engine.ingest(&conn.connection_id, twitch("late", "alice", GOOD)).await {
        Ingested::Accepted { listeners, .. } => assert_eq!(listeners, 0),
        other => panic!("expected accepted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upstream_deliveries_flow_end_to_end() {
    let h = harness(test_config()).await;
    let feed = h.twitch.push_live();
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut sub = h.engine.subscribe(&conn.connection_id).unwrap();

    feed.send(Ok(Delivery::Push(vec![
        twitch("e1", "alice", GOOD),
        twitch("e2", "bob", "lol lol lol lol"),
        twitch("e3", "carol", GOOD),
    ])))
    .unwrap();

    assert_eq!(next_message_id(&mut sub).await, "e1");
    assert_eq!(next_message_id(&mut sub).await, "e3");
    assert!(h.engine.settle(WAIT).await);
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 2);
    assert_eq!(h.engine.reputation("bob").reputation, -1);
}

#[tokio::test]
async fn test_idle_stream_is_torn_down() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut sub = h.engine.subscribe(&conn.connection_id).unwrap();

    assert_eq!(h.engine.sweep_inactive(Duration::ZERO).await, 1);
    match next_frame(&mut sub).await {
        HubFrame::Closed { reason } => assert_eq!(reason, "inactive"),
        other => panic!("expected close, got {:?}", other),
    }
    assert!(h.engine.connections().is_empty());
    assert!(h.checkpoints.is_empty());
}

#[tokio::test]
async fn test_shutdown_flushes_pending_batches() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    for id in ["a", "b", "c"] {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    assert_eq!(h.engine.stats().await.pending_messages, 3);

    h.engine.shutdown().await;
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 3);
    assert!(h.engine.connections().is_empty());
    assert!(h.checkpoints.is_empty());
}

#[tokio::test]
async fn test_observers_receive_metrics() {
    let mut config = test_config();
    config.hub.metrics_interval_secs = 1;
    let h = harness(config).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    h.engine.ingest(&conn.connection_id, twitch("a", "alice", GOOD)).await;

    let mut observer = h.engine.observe();
    let snapshot = tokio::time::timeout(WAIT, observer.recv()).await.expect("no metrics").unwrap();
    assert_eq!(snapshot.connections, 1);
    assert_eq!(snapshot.messages.broadcast, 1);
    assert_eq!(h.engine.stats().await.hub.observers, 1);
}
