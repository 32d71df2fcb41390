use super::StorePool;
use crate::atoms::error::EngineResult;
use crate::atoms::traits::CheckpointStore;
use crate::atoms::types::Checkpoint;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

/// Checkpoints as JSON payloads keyed by `connection:{id}`, with an absolute
/// expiry. Expired rows are invisible and swept on every load.
pub struct SqliteCheckpointStore {
    pool: Arc<StorePool>,
}

impl SqliteCheckpointStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        SqliteCheckpointStore { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint, ttl: Duration) -> EngineResult<()> {
        let key = Checkpoint::store_key(&checkpoint.connection_id);
        let connection_id = checkpoint.connection_id.clone();
        let payload = serde_json::to_string(checkpoint)?;
        let saved_at = checkpoint.saved_at.to_rfc3339();
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints (key, connection_id, payload, saved_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(key) DO UPDATE SET
                        payload = excluded.payload,
                        saved_at = excluded.saved_at,
                        expires_at = excluded.expires_at",
                    params![key, connection_id, payload, saved_at, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_all(&self) -> EngineResult<Vec<Checkpoint>> {
        let now = Utc::now().timestamp_millis();
        let payloads: Vec<(String, String)> = self
            .pool
            .run(move |conn| {
                let swept = conn.execute("DELETE FROM checkpoints WHERE expires_at <= ?1", params![now])?;
                if swept > 0 {
                    debug!("[checkpoint] Swept {} expired checkpoints", swept);
                }
                let mut stmt = conn.prepare("SELECT key, payload FROM checkpoints ORDER BY saved_at ASC")?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut checkpoints = Vec::with_capacity(payloads.len());
        for (key, payload) in payloads {
            match serde_json::from_str::<Checkpoint>(&payload) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!("[checkpoint] Skipping unreadable checkpoint {}: {}", key, e),
            }
        }
        Ok(checkpoints)
    }

    async fn delete(&self, connection_id: &str) -> EngineResult<()> {
        let key = Checkpoint::store_key(connection_id);
        self.pool
            .run(move |conn| {
                conn.execute("DELETE FROM checkpoints WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Platform, SessionCursor};

    fn checkpoint(id: &str) -> Checkpoint {
        Checkpoint {
            connection_id: id.into(),
            platform: Platform::YouTube,
            channel: "dQw4w9WgXcQ".into(),
            cursor: SessionCursor {
                resolved_id: Some("live-chat-1".into()),
                page_token: Some("tok-9".into()),
                poll_interval_ms: Some(20_000),
            },
            last_message_id: Some("m-41".into()),
            saved_at: Utc::now(),
        }
    }

    fn test_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::new(Arc::new(StorePool::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = test_store();
        store.save(&checkpoint("yt-1"), Duration::from_secs(3600)).await.unwrap();
        let mut updated = checkpoint("yt-1");
        updated.cursor.page_token = Some("tok-10".into());
        store.save(&updated, Duration::from_secs(3600)).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cursor.page_token.as_deref(), Some("tok-10"));

        store.delete("yt-1").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_checkpoints_are_invisible() {
        let store = test_store();
        store.save(&checkpoint("old"), Duration::from_millis(0)).await.unwrap();
        store.save(&checkpoint("new"), Duration::from_secs(60)).await.unwrap();
        let ids: Vec<String> = store.load_all().await.unwrap().into_iter().map(|c| c.connection_id).collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }
}
