// Batch triggers, idempotent writes and the inline fallback.

use crate::support::{eventually, harness, test_config, twitch, GOOD};
use chorus::engine::persistence::PersistenceMode;
use chorus::Engine;
use chorus_core::atoms::traits::MessageSink;
use chorus_core::moderation::Moderator;
use chorus_core::store::{MessageStore, RetentionPolicy, StorePool};
use chorus_core::{ChannelKey, ChatDraft, Platform};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn stored_ids(store: &MessageStore) -> Vec<String> {
    store.in_arrival_order("twitch-abc").await.unwrap().into_iter().map(|m| m.id).collect()
}

async fn back_to_queued(engine: &Engine) -> bool {
    eventually(WAIT, || {
        let engine = engine.clone();
        async move { engine.stats().await.persistence.mode == PersistenceMode::Queued }
    })
    .await
}

#[tokio::test]
async fn test_rewriting_a_batch_stores_nothing_twice() {
    let store = MessageStore::new(Arc::new(StorePool::open_in_memory().unwrap()), RetentionPolicy::default());
    let moderator = Moderator::default();
    let key = ChannelKey::new(Platform::Twitch, "abc").unwrap();
    let messages: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| {
            let draft = ChatDraft { id: id.to_string(), identity: "alice".into(), text: GOOD.into(), timestamp: Utc::now() };
            moderator.moderate(&key, draft).unwrap().0
        })
        .collect();

    let first = store.write_batch("twitch-abc", messages.clone()).await.unwrap();
    assert_eq!(first.inserted, vec!["a", "b", "c"]);
    let again = store.write_batch("twitch-abc", messages).await.unwrap();
    assert!(again.inserted.is_empty());
    assert_eq!(again.duplicates, 3);
    assert_eq!(store.count("twitch-abc").await.unwrap(), 3);
}

#[tokio::test]
async fn test_queue_outage_falls_back_to_inline_writes() {
    let h = harness(test_config()).await;
    h.queue.set_available(false);
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();

    let ids: Vec<String> = (0..50).map(|i| format!("m{:02}", i)).collect();
    for id in &ids {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }

    // Inline writes complete before ingest returns
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 50);
    assert_eq!(stored_ids(&h.store).await, ids);

    let stats = h.engine.stats().await;
    assert_eq!(stats.persistence.mode, PersistenceMode::Inline);
    assert_eq!(stats.persistence.units_inline, 5);
    assert_eq!(stats.persistence.fallbacks, 1);
    assert!(stats.errors["queue_unavailable"] >= 1);
    assert_eq!(stats.messages.broadcast, 50);
}

#[tokio::test]
async fn test_queue_recovery_resumes_queued_writes() {
    let h = harness(test_config()).await;
    h.queue.set_available(false);
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let mut ids: Vec<String> = (0..10).map(|i| format!("down{}", i)).collect();
    for id in &ids {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    assert_eq!(h.engine.stats().await.persistence.mode, PersistenceMode::Inline);

    h.queue.set_available(true);
    assert!(back_to_queued(&h.engine).await);

    let up: Vec<String> = (0..10).map(|i| format!("up{}", i)).collect();
    for id in &up {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    assert!(h.engine.settle(WAIT).await);
    ids.extend(up);
    assert_eq!(stored_ids(&h.store).await, ids);
    assert!(h.engine.stats().await.persistence.units_enqueued >= 1);
}

#[tokio::test]
async fn test_outage_never_stores_later_batches_first() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();
    let ids: Vec<String> = (0..30).map(|i| format!("m{:02}", i)).collect();

    // First batch goes to the queue, the second is written inline
    for id in &ids[..10] {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    h.queue.set_available(false);
    for id in &ids[10..20] {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    assert_eq!(stored_ids(&h.store).await, ids[..20].to_vec());

    h.queue.set_available(true);
    assert!(back_to_queued(&h.engine).await);
    for id in &ids[20..] {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    assert!(h.engine.settle(WAIT).await);
    assert_eq!(stored_ids(&h.store).await, ids);
    assert_eq!(h.engine.stats().await.persistence.held, 0);
}

#[tokio::test]
async fn test_full_batch_flushes_without_waiting() {
    let h = harness(test_config()).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();

    for i in 0..9 {
        h.engine.ingest(&conn.connection_id, twitch(&format!("m{}", i), "alice", GOOD)).await;
    }
    assert_eq!(h.engine.stats().await.pending_messages, 9);
    assert_eq!(h.store.count("twitch-abc").await.unwrap(), 0);

    h.engine.ingest(&conn.connection_id, twitch("m9", "alice", GOOD)).await;
    assert_eq!(h.engine.stats().await.pending_messages, 0);
    let stored = eventually(WAIT, || {
        let store = h.store.clone();
        async move { store.count("twitch-abc").await.unwrap_or(0) == 10 }
    })
    .await;
    assert!(stored);
}

#[tokio::test]
async fn test_partial_batch_flushes_after_interval() {
    let mut config = test_config();
    config.batch.interval_ms = 100;
    let h = harness(config).await;
    let conn = h.engine.connect(Platform::Twitch, "abc").unwrap();

    for id in ["a", "b", "c"] {
        h.engine.ingest(&conn.connection_id, twitch(id, "alice", GOOD)).await;
    }
    let stored = eventually(WAIT, || {
        let store = h.store.clone();
        async move { store.count("twitch-abc").await.unwrap_or(0) == 3 }
    })
    .await;
    assert!(stored);
    assert_eq!(h.engine.stats().await.pending_messages, 0);
}
