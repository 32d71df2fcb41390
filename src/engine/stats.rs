// Chorus Engine — Introspection
// Lock-free counters updated on the hot path, and the snapshots built from
// them for getStats() and the observer metrics feed. Only aggregated error
// counts are exposed; individual failures stay in the logs.

use crate::engine::connections::{ConnectionHealth, ConnectionInfo};
use crate::engine::hub::HubStats;
use crate::engine::persistence::{PersistenceMode, PersistenceStats};
use chorus_core::moderation::classifier::ClassifierStats;
use chorus_core::moderation::reputation::ReputationStats;
use chorus_core::moderation::sentiment::MoodCounts;
use chorus_core::ErrorClass;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ── Error counters ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ErrorCounters {
    counts: [AtomicU64; ErrorClass::ALL.len()],
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, class: ErrorClass) {
        self.counts[Self::slot(class)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, class: ErrorClass) -> u64 {
        self.counts[Self::slot(class)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        ErrorClass::ALL.iter().map(|c| (c.as_str().to_string(), self.get(*c))).collect()
    }

    fn slot(class: ErrorClass) -> usize {
        ErrorClass::ALL.iter().position(|c| *c == class).unwrap_or(ErrorClass::ALL.len() - 1)
    }
}

// ── Message counters ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MessageCounters {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub broadcast: AtomicU64,
    pub spam_dropped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub invalid_dropped: AtomicU64,
    /// Arrived for a connection that is no longer active.
    pub orphaned_dropped: AtomicU64,
    pub questions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub received: u64,
    pub processed: u64,
    pub broadcast: u64,
    pub spam_dropped: u64,
    pub duplicates_dropped: u64,
    pub invalid_dropped: u64,
    pub orphaned_dropped: u64,
    pub questions: u64,
}

impl MessageCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MessageStats {
        MessageStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            spam_dropped: self.spam_dropped.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            invalid_dropped: self.invalid_dropped.load(Ordering::Relaxed),
            orphaned_dropped: self.orphaned_dropped.load(Ordering::Relaxed),
            questions: self.questions.load(Ordering::Relaxed),
        }
    }
}

// ── Snapshots ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub messages: MessageStats,
    pub connections: Vec<ConnectionInfo>,
    pub health: Vec<ConnectionHealth>,
    pub hub: HubStats,
    pub persistence: PersistenceStats,
    /// Accepted messages not yet handed to persistence.
    pub pending_messages: usize,
    pub classifier: ClassifierStats,
    pub reputation: ReputationStats,
    pub moods: MoodCounts,
    pub errors: BTreeMap<String, u64>,
}

/// Periodic summary pushed to operational observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub connections: usize,
    pub unhealthy: usize,
    pub streams: usize,
    pub listeners: usize,
    pub messages: MessageStats,
    pub persistence_mode: PersistenceMode,
    pub pending_messages: usize,
    pub rows_inserted: u64,
    pub errors: BTreeMap<String, u64>,
}

impl EngineStats {
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            at: self.generated_at,
            connections: self.connections.len(),
            unhealthy: self.health.iter().filter(|h| !h.healthy).count(),
            streams: self.hub.streams,
            listeners: self.hub.listeners,
            messages: self.messages,
            persistence_mode: self.persistence.mode,
            pending_messages: self.pending_messages,
            rows_inserted: self.persistence.rows_inserted,
            errors: self.errors.clone(),
        }
    }
}
