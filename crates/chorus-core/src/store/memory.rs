// In-process CheckpointStore and WorkQueue.
// Used by tests and by deployments that run without a database file. The
// queue can be switched unreachable to exercise the inline fallback.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{CheckpointStore, Lease, WorkQueue};
use crate::atoms::types::{Checkpoint, FlushUnit};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ── Checkpoints ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, (Checkpoint, Instant)>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint, ttl: Duration) -> EngineResult<()> {
        let key = Checkpoint::store_key(&checkpoint.connection_id);
        self.entries.write().insert(key, (checkpoint.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn load_all(&self) -> EngineResult<Vec<Checkpoint>> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, (_, expires)| *expires > now);
        let mut all: Vec<Checkpoint> = entries.values().map(|(cp, _)| cp.clone()).collect();
        all.sort_by_key(|cp| cp.saved_at);
        Ok(all)
    }

    async fn delete(&self, connection_id: &str) -> EngineResult<()> {
        self.entries.write().remove(&Checkpoint::store_key(connection_id));
        Ok(())
    }
}

// ── Work queue ─────────────────────────────────────────────────────────────

struct Slot {
    unit: FlushUnit,
    attempts: u32,
    lease_id: Option<String>,
    visible_at: Instant,
}

pub struct MemoryWorkQueue {
    name: String,
    available: AtomicBool,
    next_lease: AtomicU64,
    slots: Mutex<VecDeque<Slot>>,
}

impl MemoryWorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryWorkQueue {
            name: name.into(),
            available: AtomicBool::new(true),
            next_lease: AtomicU64::new(1),
            slots: Mutex::new(VecDeque::new()),
        }
    }

    /// Simulate the backend going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> EngineResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::QueueUnavailable(format!("{} is unreachable", self.name)))
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> EngineResult<()> {
        self.check()
    }

    async fn enqueue(&self, unit: &FlushUnit) -> EngineResult<()> {
        self.check()?;
        let mut slots = self.slots.lock();
        if slots.iter().any(|s| s.unit.unit_id == unit.unit_id) {
            return Ok(());
        }
        slots.push_back(Slot { unit: unit.clone(), attempts: 0, lease_id: None, visible_at: Instant::now() });
        Ok(())
    }

    async fn lease(&self, max: usize, lease_for: Duration) -> EngineResult<Vec<Lease>> {
        self.check()?;
        let now = Instant::now();
        let mut out = Vec::new();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut().filter(|s| s.visible_at <= now).take(max) {
            let lease_id = format!("lease-{}", self.next_lease.fetch_add(1, Ordering::Relaxed));
            slot.attempts += 1;
            slot.lease_id = Some(lease_id.clone());
            slot.visible_at = now + lease_for;
            out.push(Lease { lease_id, unit: slot.unit.clone(), attempts: slot.attempts });
        }
        Ok(out)
    }

    async fn ack(&self, lease_id: &str) -> EngineResult<()> {
        self.check()?;
        self.slots.lock().retain(|s| s.lease_id.as_deref() != Some(lease_id));
        Ok(())
    }

    async fn depth(&self) -> EngineResult<usize> {
        self.check()?;
        Ok(self.slots.lock().len())
    }
}
