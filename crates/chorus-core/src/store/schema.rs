// Database schema and migrations for the Chorus store.
// Called once per database by StorePool when the first connection opens.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN at the end of run_migrations(). A changed
// constraint needs a one-off rebuild step for databases created before it.

use crate::atoms::error::EngineResult;
use log::{debug, info};
use rusqlite::Connection;

const CHAT_MESSAGES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS chat_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        stream_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        identity TEXT NOT NULL,
        text TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        is_question INTEGER NOT NULL DEFAULT 0,
        is_spam INTEGER NOT NULL DEFAULT 0,
        score REAL NOT NULL DEFAULT 0,
        classification TEXT NOT NULL,
        sentiment TEXT NOT NULL,
        stored_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (stream_id, id)
    );
";

const CHAT_MESSAGES_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_chat_messages_stream
        ON chat_messages(stream_id, seq);

    CREATE INDEX IF NOT EXISTS idx_chat_messages_identity
        ON chat_messages(stream_id, identity, seq);
";

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Chat history ─────────────────────────────────────────────────
    // `seq` is arrival order; retention evicts by it. Upstream ids are only
    // unique within their stream.
    conn.execute_batch(CHAT_MESSAGES_TABLE)?;
    conn.execute_batch(CHAT_MESSAGES_INDEXES)?;

    // ── Connection checkpoints ───────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            key TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        ",
    )?;

    // ── Durable flush queue ──────────────────────────────────────────
    // `visible_at` (unix millis) hides leased rows until the lease lapses.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS work_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            unit_id TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            lease_id TEXT,
            visible_at INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_work_queue_visible
            ON work_queue(queue, visible_at, seq);

        CREATE INDEX IF NOT EXISTS idx_work_queue_lease
            ON work_queue(lease_id);
        ",
    )?;

    // ── Stream-scoped message ids ────────────────────────────────────
    // Early databases declared `id` globally UNIQUE; rebuild those once.
    let global_ids: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chat_messages'
         AND sql LIKE '%id TEXT NOT NULL UNIQUE%'",
        [],
        |r| r.get(0),
    )?;
    if global_ids > 0 {
        conn.execute_batch(&format!(
            "BEGIN;
             ALTER TABLE chat_messages RENAME TO chat_messages_global_ids;
             {}
             INSERT INTO chat_messages
                 (seq, id, stream_id, platform, identity, text, sent_at, is_question, is_spam,
                  score, classification, sentiment, stored_at)
             SELECT seq, id, stream_id, platform, identity, text, sent_at, is_question, is_spam,
                    score, classification, sentiment, stored_at
             FROM chat_messages_global_ids;
             DROP TABLE chat_messages_global_ids;
             {}
             COMMIT;",
            CHAT_MESSAGES_TABLE, CHAT_MESSAGES_INDEXES
        ))?;
        info!("[store] Rebuilt chat_messages with per-stream message ids");
    }

    debug!("[store] Migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('chat_messages', 'checkpoints', 'work_queue')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_global_id_constraint_is_rebuilt_per_stream() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE chat_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                stream_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                identity TEXT NOT NULL,
                text TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                is_question INTEGER NOT NULL DEFAULT 0,
                is_spam INTEGER NOT NULL DEFAULT 0,
                score REAL NOT NULL DEFAULT 0,
                classification TEXT NOT NULL,
                sentiment TEXT NOT NULL,
                stored_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT INTO chat_messages (id, stream_id, platform, identity, text, sent_at, classification, sentiment)
            VALUES ('42', 'twitch-abc', 'twitch', 'u1', 'hi', '2024-01-01T00:00:00Z', 'quality', 'neutral');",
        )
        .unwrap();

        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO chat_messages (id, stream_id, platform, identity, text, sent_at, classification, sentiment)
             VALUES ('42', 'kick-xyz', 'kick', 'u1', 'hi', '2024-01-01T00:00:00Z', 'quality', 'neutral')",
            [],
        )
        .unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM chat_messages WHERE id = '42'", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 2);

        // Same id on the same stream is still refused
        let again = conn.execute(
            "INSERT INTO chat_messages (id, stream_id, platform, identity, text, sent_at, classification, sentiment)
             VALUES ('42', 'kick-xyz', 'kick', 'u1', 'hi', '2024-01-01T00:00:00Z', 'quality', 'neutral')",
            [],
        );
        assert!(again.is_err());
    }
}
