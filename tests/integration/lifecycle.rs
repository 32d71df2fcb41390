// Connection lifecycle: retries, teardown, checkpoints, resume, poll cadence.

use crate::support::{eventually, kick, ScriptedConnector, WhenEmpty};
use chorus::config::ConnectionSettings;
use chorus::engine::connections::{ConnectionEvent, ConnectionManager};
use chorus::engine::platforms::PlatformRegistry;
use chorus_core::atoms::traits::{CheckpointStore, Delivery};
use chorus_core::store::MemoryCheckpointStore;
use chorus_core::{ChannelKey, Checkpoint, DisconnectReason, Platform, RawEvent, SessionCursor};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_retries: 3,
        min_poll_ms: 50,
        default_poll_ms: 100,
        ..ConnectionSettings::default()
    }
}

fn manager(
    connector: Arc<ScriptedConnector>,
) -> (ConnectionManager, mpsc::Receiver<ConnectionEvent>, Arc<MemoryCheckpointStore>) {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (manager, events) =
        ConnectionManager::new(fast_settings(), PlatformRegistry::new().with(connector), checkpoints.clone());
    (manager, events, checkpoints)
}

/// Read events until one matches, returning everything seen.
async fn collect_until(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    done: impl Fn(&ConnectionEvent) -> bool,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn is_disconnect(event: &ConnectionEvent) -> bool {
    matches!(event, ConnectionEvent::Disconnected { .. })
}

fn kick_ids(events: &[RawEvent]) -> Vec<String> {
    events.iter().filter_map(|e| e.upstream_id().map(str::to_string)).collect()
}

#[tokio::test]
async fn test_max_retries_ends_with_exactly_one_disconnect() {
    let connector = ScriptedConnector::new(Platform::Twitch, WhenEmpty::Fail);
    let (manager, mut events, checkpoints) = manager(connector.clone());

    let handle = manager.connect(ChannelKey::new(Platform::Twitch, "abc").unwrap()).unwrap();
    let seen = collect_until(&mut events, is_disconnect).await;

    let retries = seen.iter().filter(|e| matches!(e, ConnectionEvent::Retrying { .. })).count();
    assert_eq!(retries, 2);
    match seen.last() {
        Some(ConnectionEvent::Disconnected { connection_id, reason, .. }) => {
            assert_eq!(connection_id, &handle.connection_id);
            assert_eq!(*reason, DisconnectReason::MaxRetries);
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert_eq!(connector.opens(), 3);

    // Nothing follows the terminal event
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv()).await.is_err());
    assert!(!manager.is_active(&handle.connection_id));
    assert!(checkpoints.is_empty());
    assert!(!manager.disconnect(&handle.connection_id, DisconnectReason::Explicit).await);
}

#[tokio::test]
async fn test_connect_is_idempotent_per_channel() {
    let connector = ScriptedConnector::new(Platform::Twitch, WhenEmpty::Idle);
    let (manager, _events, _) = manager(connector);

    let first = manager.connect(ChannelKey::new(Platform::Twitch, "abc").unwrap()).unwrap();
    let again = manager.connect(ChannelKey::new(Platform::Twitch, "#ABC").unwrap()).unwrap();
    assert_eq!(first, again);
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn test_disabled_platform_is_rejected() {
    let connector = ScriptedConnector::new(Platform::Twitch, WhenEmpty::Idle);
    let (manager, _events, _) = manager(connector);
    assert!(manager.connect(ChannelKey::new(Platform::Kick, "xyz").unwrap()).is_err());
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_explicit_disconnect_deletes_checkpoint() {
    let connector = ScriptedConnector::new(Platform::Kick, WhenEmpty::Idle);
    let (manager, mut events, checkpoints) = manager(connector);

    let handle = manager.connect(ChannelKey::new(Platform::Kick, "somestreamer").unwrap()).unwrap();
    collect_until(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
    let saved = eventually(Duration::from_secs(2), || {
        let checkpoints = checkpoints.clone();
        async move { checkpoints.len() == 1 }
    })
    .await;
    assert!(saved);

    assert!(manager.disconnect(&handle.connection_id, DisconnectReason::Explicit).await);
    let seen = collect_until(&mut events, is_disconnect).await;
    assert!(matches!(
        seen.last(),
        Some(ConnectionEvent::Disconnected { reason: DisconnectReason::Explicit, .. })
    ));
    assert!(checkpoints.is_empty());
    assert!(!manager.disconnect(&handle.connection_id, DisconnectReason::Explicit).await);
}

#[tokio::test]
async fn test_transient_failure_recovers_without_new_announcement() {
    let connector = ScriptedConnector::new(Platform::Kick, WhenEmpty::Idle);
    connector.push_failure();
    let feed = connector.push_live();
    let (manager, mut events, _) = manager(connector.clone());

    manager.connect(ChannelKey::new(Platform::Kick, "somestreamer").unwrap()).unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
    assert!(seen.iter().any(|e| matches!(e, ConnectionEvent::Retrying { attempt: 1, .. })));

    feed.send(Ok(Delivery::Push(vec![kick("k1", "viewer", "hello")]))).unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::Messages { .. })).await;
    assert!(!seen.iter().any(|e| matches!(e, ConnectionEvent::Connected { .. })));
    assert_eq!(manager.list()[0].retries, 0);
    assert_eq!(manager.list()[0].errors, 1);
}

#[tokio::test]
async fn test_quota_exhaustion_disconnects_with_quota_reason() {
    let connector = ScriptedConnector::new(Platform::YouTube, WhenEmpty::Idle);
    connector.push_quota_exceeded();
    let (manager, mut events, _) = manager(connector);

    manager.connect(ChannelKey::new(Platform::YouTube, "dQw4w9WgXcQ").unwrap()).unwrap();
    let seen = collect_until(&mut events, is_disconnect).await;
    assert!(!seen.iter().any(|e| matches!(e, ConnectionEvent::Retrying { .. })));
    assert!(matches!(seen.last(), Some(ConnectionEvent::Disconnected { reason: DisconnectReason::Quota, .. })));
}

#[tokio::test]
async fn test_restore_resumes_without_replay_or_announcement() {
    let connector = ScriptedConnector::new(Platform::Kick, WhenEmpty::Idle);
    let feed = connector.push_live();
    let (manager, mut events, checkpoints) = manager(connector.clone());

    let fresh = Checkpoint {
        connection_id: "kick-somestreamer-1700000000000".into(),
        platform: Platform::Kick,
        channel: "somestreamer".into(),
        cursor: SessionCursor { resolved_id: Some("4598".into()), ..SessionCursor::default() },
        last_message_id: Some("k2".into()),
        saved_at: Utc::now(),
    };
    let stale = Checkpoint {
        connection_id: "kick-other-1600000000000".into(),
        channel: "other".into(),
        saved_at: Utc::now() - chrono::Duration::hours(2),
        ..fresh.clone()
    };
    checkpoints.save(&fresh, Duration::from_secs(3600)).await.unwrap();
    checkpoints.save(&stale, Duration::from_secs(3600)).await.unwrap();

    let restored = manager.restore().await.unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].connection_id, fresh.connection_id);
    assert!(manager.is_active(&fresh.connection_id));

    feed.send(Ok(Delivery::Push(vec![
        kick("k1", "viewer", "already seen"),
        kick("k2", "viewer", "already seen too"),
        kick("k3", "viewer", "new one"),
    ])))
    .unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, ConnectionEvent::Messages { .. })).await;
    assert!(!seen.iter().any(|e| matches!(e, ConnectionEvent::Connected { .. })));
    match seen.last() {
        Some(ConnectionEvent::Messages { events, .. }) => assert_eq!(kick_ids(events), vec!["k3"]),
        other => panic!("expected messages, got {:?}", other),
    }

    let resumed_with = connector.resumes();
    assert_eq!(resumed_with[0].as_ref().and_then(|c| c.resolved_id.as_deref()), Some("4598"));
    let remaining = checkpoints.load_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].connection_id, fresh.connection_id);
}

#[tokio::test]
async fn test_poll_interval_never_drops_below_floor() {
    let connector = ScriptedConnector::new(Platform::YouTube, WhenEmpty::Idle);
    let feed = connector.push_live();
    let (manager, _events, _) = manager(connector);

    manager.connect(ChannelKey::new(Platform::YouTube, "dQw4w9WgXcQ").unwrap()).unwrap();
    feed.send(Ok(Delivery::Poll { events: Vec::new(), interval_hint: Some(Duration::from_millis(10)), api_calls: 1 }))
        .unwrap();

    let settled = eventually(Duration::from_secs(3), || {
        let manager = manager.clone();
        async move { manager.list().first().and_then(|c| c.poll_interval_ms) == Some(50) }
    })
    .await;
    assert!(settled);
    let info = &manager.list()[0];
    assert_eq!(info.quota.as_ref().map(|q| q.calls), Some(1));
    assert!(info.last_poll.is_some());
}
