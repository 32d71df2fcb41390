// ── Chorus Atoms: Collaborator Traits ──────────────────────────────────────
// Seams between the pipeline and the outside world. Each has a production
// implementation (SQLite store, platform sessions) and in-process doubles
// used by tests.

use crate::atoms::error::EngineResult;
use crate::atoms::types::{
    CanonicalMessage, ChannelKey, Checkpoint, FlushUnit, Platform, RawEvent, SessionCursor,
    WriteReport,
};
use async_trait::async_trait;
use std::time::Duration;

// ── Durable storage ────────────────────────────────────────────────────────

/// Idempotent batched insert keyed by message id, with retention trimming.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one batch in a single transaction. Ids already stored are
    /// counted as duplicates, never written twice.
    async fn write_batch(
        &self,
        stream_id: &str,
        messages: Vec<CanonicalMessage>,
    ) -> EngineResult<WriteReport>;
}

// ── Checkpoints ────────────────────────────────────────────────────────────

/// Key-value store with TTL for connection state across restarts.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint, ttl: Duration) -> EngineResult<()>;
    /// Every checkpoint whose TTL has not lapsed.
    async fn load_all(&self) -> EngineResult<Vec<Checkpoint>>;
    async fn delete(&self, connection_id: &str) -> EngineResult<()>;
}

// ── Durable work queue ─────────────────────────────────────────────────────

/// A unit of work handed to a worker. Unacked leases become visible again
/// once they expire (at-least-once).
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub unit: FlushUnit,
    pub attempts: u32,
}

/// Named units of work, pulled by workers. May be unreachable; callers
/// must treat `QueueUnavailable` as a signal to write inline instead.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;
    /// Cheap reachability probe.
    async fn ping(&self) -> EngineResult<()>;
    async fn enqueue(&self, unit: &FlushUnit) -> EngineResult<()>;
    async fn lease(&self, max: usize, lease_for: Duration) -> EngineResult<Vec<Lease>>;
    async fn ack(&self, lease_id: &str) -> EngineResult<()>;
    /// Units waiting or leased.
    async fn depth(&self) -> EngineResult<usize>;
}

// ── Platform sessions ──────────────────────────────────────────────────────

/// What one read from an upstream session produced.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Frames pushed by a streaming upstream (IRC, Pusher).
    Push(Vec<RawEvent>),
    /// One poll cycle. The lifecycle manager sleeps before the next read,
    /// honouring `interval_hint` but never going below its floor.
    Poll {
        events: Vec<RawEvent>,
        interval_hint: Option<Duration>,
        api_calls: u32,
    },
    /// Keepalive traffic, nothing to forward.
    Idle,
}

/// A live upstream protocol handle.
#[async_trait]
pub trait PlatformSession: Send {
    /// Next batch of events. `Err` ends the session and triggers a retry
    /// (`QuotaExceeded` ends the connection).
    async fn next_delivery(&mut self) -> EngineResult<Delivery>;
    /// Resume state to checkpoint.
    fn cursor(&self) -> SessionCursor;
    /// Release the protocol handle.
    async fn close(&mut self);
}

/// Opens sessions for one platform.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    fn platform(&self) -> Platform;
    async fn open(
        &self,
        key: &ChannelKey,
        resume: Option<&SessionCursor>,
    ) -> EngineResult<Box<dyn PlatformSession>>;
    /// Periodic housekeeping (key-ring resets). Default: nothing.
    fn maintain(&self) {}
}
