use super::StorePool;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{Lease, WorkQueue};
use crate::atoms::types::FlushUnit;
use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use rusqlite::{params, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;

/// Durable queue of flush units in the `work_queue` table. Leasing hides a
/// row until its lease lapses; an unacked row is handed out again.
pub struct SqliteWorkQueue {
    pool: Arc<StorePool>,
    name: String,
}

impl SqliteWorkQueue {
    pub fn new(pool: Arc<StorePool>, name: impl Into<String>) -> Self {
        SqliteWorkQueue { pool, name: name.into() }
    }

    /// Drop rows whose payload no longer decodes; they would fail every lease.
    async fn discard(&self, seqs: Vec<i64>) -> EngineResult<()> {
        self.pool
            .run(move |conn| {
                for seq in &seqs {
                    conn.execute("DELETE FROM work_queue WHERE seq = ?1", params![seq])?;
                }
                Ok(())
            })
            .await
            .map_err(unavailable)
    }
}

/// Any storage failure on the queue path means the backend is unreachable
/// as far as the pipeline is concerned.
fn unavailable(e: EngineError) -> EngineError {
    match e {
        EngineError::QueueUnavailable(_) => e,
        other => EngineError::QueueUnavailable(other.to_string()),
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> EngineResult<()> {
        self.pool
            .run(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn enqueue(&self, unit: &FlushUnit) -> EngineResult<()> {
        let queue = self.name.clone();
        let unit_id = unit.unit_id.clone();
        let payload = serde_json::to_string(unit)?;
        let now = Utc::now().timestamp_millis();
        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO work_queue (queue, unit_id, payload, visible_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![queue, unit_id, payload, now],
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn lease(&self, max: usize, lease_for: Duration) -> EngineResult<Vec<Lease>> {
        let queue = self.name.clone();
        let now = Utc::now().timestamp_millis();
        let until = now + lease_for.as_millis() as i64;
        let rows: Vec<(i64, String, u32)> = self
            .pool
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let rows = {
                    let mut stmt = tx.prepare(
                        "SELECT seq, payload, attempts FROM work_queue
                         WHERE queue = ?1 AND visible_at <= ?2
                         ORDER BY seq ASC LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![queue, now, max as i64], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                        .collect::<rusqlite::Result<Vec<(i64, String, u32)>>>()?;
                    rows
                };
                for (seq, _, _) in &rows {
                    tx.execute(
                        "UPDATE work_queue SET lease_id = ?1, visible_at = ?2, attempts = attempts + 1
                         WHERE seq = ?3",
                        params![format!("lease-{}", seq), until, seq],
                    )?;
                }
                tx.commit()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;

        let mut leases = Vec::with_capacity(rows.len());
        let mut unreadable = Vec::new();
        for (seq, payload, attempts) in rows {
            match serde_json::from_str::<FlushUnit>(&payload) {
                Ok(unit) => leases.push(Lease { lease_id: format!("lease-{}", seq), unit, attempts: attempts + 1 }),
                Err(e) => {
                    warn!("[queue] Discarding unreadable unit #{} in {}: {}", seq, self.name, e);
                    unreadable.push(seq);
                }
            }
        }
        if !unreadable.is_empty() {
            self.discard(unreadable).await?;
        }
        Ok(leases)
    }

    async fn ack(&self, lease_id: &str) -> EngineResult<()> {
        let lease_id = lease_id.to_string();
        self.pool
            .run(move |conn| {
                conn.execute("DELETE FROM work_queue WHERE lease_id = ?1", params![lease_id])?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    async fn depth(&self) -> EngineResult<usize> {
        let queue = self.name.clone();
        self.pool
            .run(move |conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM work_queue WHERE queue = ?1", params![queue], |r| r.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(unavailable)
    }
}
