use super::StorePool;
use crate::atoms::constants::{DEFAULT_PER_IDENTITY_CAP, DEFAULT_PER_STREAM_CAP};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::MessageSink;
use crate::atoms::types::{CanonicalMessage, WriteReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage ceilings applied before each insert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub per_identity_cap: i64,
    pub per_stream_cap: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            per_identity_cap: DEFAULT_PER_IDENTITY_CAP,
            per_stream_cap: DEFAULT_PER_STREAM_CAP,
        }
    }
}

pub struct MessageStore {
    pool: Arc<StorePool>,
    retention: RetentionPolicy,
}

const SELECT_COLUMNS: &str = "id, stream_id, platform, identity, text, sent_at, is_question, \
                              is_spam, score, classification, sentiment";

fn parse_col<T: std::str::FromStr<Err = EngineError>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_message(row: &Row) -> rusqlite::Result<CanonicalMessage> {
    let sent_at: String = row.get(5)?;
    let timestamp = DateTime::parse_from_rfc3339(&sent_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(CanonicalMessage {
        id: row.get(0)?,
        stream_id: row.get(1)?,
        platform: parse_col(row, 2)?,
        identity: row.get(3)?,
        text: row.get(4)?,
        timestamp,
        is_question: row.get(6)?,
        is_spam: row.get(7)?,
        score: row.get(8)?,
        classification: parse_col(row, 9)?,
        sentiment: parse_col(row, 10)?,
    })
}

/// Delete the oldest `n` rows matching `filter`.
fn evict_oldest(conn: &Connection, stream_id: &str, identity: Option<&str>, n: i64) -> EngineResult<usize> {
    if n <= 0 {
        return Ok(0);
    }
    let deleted = match identity {
        Some(identity) => conn.execute(
            "DELETE FROM chat_messages WHERE seq IN (
                SELECT seq FROM chat_messages WHERE stream_id = ?1 AND identity = ?2
                ORDER BY seq ASC LIMIT ?3)",
            params![stream_id, identity, n],
        )?,
        None => conn.execute(
            "DELETE FROM chat_messages WHERE seq IN (
                SELECT seq FROM chat_messages WHERE stream_id = ?1
                ORDER BY seq ASC LIMIT ?2)",
            params![stream_id, n],
        )?,
    };
    Ok(deleted)
}

/// Insert a batch for one stream in one IMMEDIATE transaction. Ids already
/// present in the stream are skipped; retention ceilings are enforced before
/// each insert. Any error drops the transaction, rolling back the whole batch.
pub fn insert_batch(
    conn: &mut Connection,
    stream_id: &str,
    messages: &[CanonicalMessage],
    retention: RetentionPolicy,
) -> EngineResult<WriteReport> {
    if let Some(stray) = messages.iter().find(|m| m.stream_id != stream_id) {
        return Err(EngineError::Persistence(format!(
            "message {} belongs to {}, not {}",
            stray.id, stray.stream_id, stream_id
        )));
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = WriteReport::default();

    for msg in messages {
        let exists = tx
            .query_row(
                "SELECT 1 FROM chat_messages WHERE stream_id = ?1 AND id = ?2",
                params![msg.stream_id, msg.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            report.duplicates += 1;
            continue;
        }

        let by_identity: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE stream_id = ?1 AND identity = ?2",
            params![msg.stream_id, msg.identity],
            |r| r.get(0),
        )?;
        if by_identity >= retention.per_identity_cap {
            let n = by_identity - retention.per_identity_cap + 1;
            report.evicted += evict_oldest(&tx, &msg.stream_id, Some(&msg.identity), n)?;
        }

        let by_stream: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE stream_id = ?1",
            params![msg.stream_id],
            |r| r.get(0),
        )?;
        if by_stream >= retention.per_stream_cap {
            let n = by_stream - retention.per_stream_cap + 1;
            report.evicted += evict_oldest(&tx, &msg.stream_id, None, n)?;
        }

        let changed = tx.execute(
            "INSERT OR IGNORE INTO chat_messages
                (id, stream_id, platform, identity, text, sent_at, is_question, is_spam,
                 score, classification, sentiment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                msg.id,
                msg.stream_id,
                msg.platform.as_str(),
                msg.identity,
                msg.text,
                msg.timestamp.to_rfc3339(),
                msg.is_question,
                msg.is_spam,
                msg.score,
                msg.classification.as_str(),
                msg.sentiment.as_str(),
            ],
        )?;
        if changed == 1 {
            report.inserted.push(msg.id.clone());
        } else {
            report.duplicates += 1;
        }
    }

    tx.commit()?;
    Ok(report)
}

impl MessageStore {
    pub fn new(pool: Arc<StorePool>, retention: RetentionPolicy) -> Self {
        MessageStore { pool, retention }
    }

    // ── History queries ────────────────────────────────────────────────

    /// Most recent messages of a stream, newest first.
    pub async fn recent(&self, stream_id: &str, limit: i64) -> EngineResult<Vec<CanonicalMessage>> {
        let stream_id = stream_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM chat_messages WHERE stream_id = ?1 ORDER BY seq DESC LIMIT ?2",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![stream_id, limit], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Stored messages flagged as questions, newest first.
    pub async fn questions(&self, stream_id: &str, limit: i64) -> EngineResult<Vec<CanonicalMessage>> {
        let stream_id = stream_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM chat_messages WHERE stream_id = ?1 AND is_question = 1
                     ORDER BY seq DESC LIMIT ?2",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![stream_id, limit], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Messages of a stream in arrival order (oldest first).
    pub async fn in_arrival_order(&self, stream_id: &str) -> EngineResult<Vec<CanonicalMessage>> {
        let stream_id = stream_id.to_string();
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM chat_messages WHERE stream_id = ?1 ORDER BY seq ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![stream_id], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self, stream_id: &str) -> EngineResult<i64> {
        let stream_id = stream_id.to_string();
        self.pool
            .run(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM chat_messages WHERE stream_id = ?1",
                    params![stream_id],
                    |r| r.get(0),
                )?)
            })
            .await
    }

    /// (stream_id, stored messages) for every stream, busiest first.
    pub async fn stream_counts(&self) -> EngineResult<Vec<(String, i64)>> {
        self.pool
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT stream_id, COUNT(*) AS n FROM chat_messages
                     GROUP BY stream_id ORDER BY n DESC, stream_id ASC",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }
}

#[async_trait]
impl MessageSink for MessageStore {
    async fn write_batch(&self, stream_id: &str, messages: Vec<CanonicalMessage>) -> EngineResult<WriteReport> {
        let retention = self.retention;
        let stream = stream_id.to_string();
        let target = stream.clone();
        let report = self.pool.run(move |conn| insert_batch(conn, &target, &messages, retention)).await?;
        debug!(
            "[store] {}: {} inserted, {} duplicate, {} evicted",
            stream,
            report.inserted.len(),
            report.duplicates,
            report.evicted
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Classification, Mood, Platform};

    fn msg(id: &str, identity: &str) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            stream_id: "twitch-abc".into(),
            platform: Platform::Twitch,
            identity: identity.into(),
            text: format!("message {}", id),
            timestamp: Utc::now(),
            is_question: id.ends_with('q'),
            is_spam: false,
            score: 50.0,
            classification: Classification::Quality,
            sentiment: Mood::Neutral,
        }
    }

    fn test_store(retention: RetentionPolicy) -> MessageStore {
        MessageStore::new(Arc::new(StorePool::open_in_memory().unwrap()), retention)
    }

    #[tokio::test]
    async fn test_duplicate_write_is_idempotent() {
        let store = test_store(RetentionPolicy::default());
        let first = store.write_batch("twitch-abc", vec![msg("a", "u1")]).await.unwrap();
        assert_eq!(first.inserted, vec!["a".to_string()]);
        let second = store.write_batch("twitch-abc", vec![msg("a", "u1")]).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(store.count("twitch-abc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_inside_one_batch() {
        let store = test_store(RetentionPolicy::default());
        let report = store
            .write_batch("twitch-abc", vec![msg("a", "u1"), msg("a", "u1"), msg("b", "u1")])
            .await
            .unwrap();
        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let store = test_store(RetentionPolicy::default());
        let original = msg("x", "u1");
        store.write_batch("twitch-abc", vec![original.clone()]).await.unwrap();
        let loaded = store.recent("twitch-abc", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, original.id);
        assert_eq!(loaded[0].classification, Classification::Quality);
        assert_eq!(loaded[0].timestamp.timestamp_millis(), original.timestamp.timestamp_millis());
    }

    #[tokio::test]
    async fn test_per_identity_retention_evicts_oldest() {
        let store = test_store(RetentionPolicy { per_identity_cap: 2, per_stream_cap: 100 });
        let batch = vec![msg("1", "u1"), msg("2", "u1"), msg("3", "u2"), msg("4", "u1")];
        let report = store.write_batch("twitch-abc", batch).await.unwrap();
        assert_eq!(report.evicted, 1);
        let ids: Vec<String> = store
            .in_arrival_order("twitch-abc")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_per_stream_retention_evicts_oldest() {
        let store = test_store(RetentionPolicy { per_identity_cap: 100, per_stream_cap: 3 });
        for i in 0..5 {
            store.write_batch("twitch-abc", vec![msg(&i.to_string(), &format!("u{}", i))]).await.unwrap();
        }
        let ids: Vec<String> = store
            .in_arrival_order("twitch-abc")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_questions_and_counts() {
        let store = test_store(RetentionPolicy::default());
        store
            .write_batch("twitch-abc", vec![msg("1q", "u1"), msg("2", "u2"), msg("3q", "u3")])
            .await
            .unwrap();
        let qs = store.questions("twitch-abc", 10).await.unwrap();
        assert_eq!(qs.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["3q", "1q"]);
        assert_eq!(store.stream_counts().await.unwrap(), vec![("twitch-abc".to_string(), 3)]);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let pool = StorePool::open_in_memory().unwrap();
        pool.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON chat_messages
                 WHEN NEW.id = 'poison' BEGIN SELECT RAISE(ABORT, 'poison'); END;",
            )?;
            let err =
                insert_batch(conn, "twitch-abc", &[msg("ok", "u1"), msg("poison", "u1")], RetentionPolicy::default());
            assert!(err.is_err());
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |r| r.get(0))?;
            assert_eq!(n, 0);
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_same_id_on_two_streams_is_stored_twice() {
        let store = test_store(RetentionPolicy::default());
        let on_kick = CanonicalMessage { stream_id: "kick-xyz".into(), platform: Platform::Kick, ..msg("42", "u1") };
        store.write_batch("twitch-abc", vec![msg("42", "u1")]).await.unwrap();
        let report = store.write_batch("kick-xyz", vec![on_kick]).await.unwrap();
        assert_eq!(report.inserted, vec!["42".to_string()]);
        assert_eq!(report.duplicates, 0);
        assert_eq!(store.count("twitch-abc").await.unwrap(), 1);
        assert_eq!(store.count("kick-xyz").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_for_another_stream_is_rejected() {
        let store = test_store(RetentionPolicy::default());
        let err = store.write_batch("kick-xyz", vec![msg("a", "u1")]).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(store.count("twitch-abc").await.unwrap(), 0);
        assert_eq!(store.count("kick-xyz").await.unwrap(), 0);
    }
}
