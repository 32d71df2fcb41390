// Chorus Engine — Persistence Queue
//
// Flush units normally go through the durable work queue: a puller leases
// them and hands each to a shard worker picked by stream id, so one stream's
// units are always written by the same worker in lease order. When the queue
// cannot be reached (or does not answer within `queue_timeout`) the unit is
// written inline instead, and the queue is probed again every `queue_probe`
// until it answers.
//
// Every queued unit is also held in a per-stream outbox until a worker has
// written it. An inline write first writes whatever its stream still holds,
// so a stream never stores later messages ahead of earlier ones. Units that
// reach the store twice this way only produce duplicates.
//
// A batch that fails to write is logged and dropped; its lease is still
// acked. Pool exhaustion is retried a few times first.

use crate::config::PersistenceSettings;
use crate::engine::stats::ErrorCounters;
use chorus_core::atoms::traits::{Lease, MessageSink, WorkQueue};
use chorus_core::{EngineError, EngineResult, ErrorClass, FlushUnit, WriteReport};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const POOL_RETRIES: u32 = 3;
const POOL_BACKOFF: Duration = Duration::from_millis(100);
const PULL_INTERVAL: Duration = Duration::from_millis(250);
const SHARD_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    Queued,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceStats {
    pub mode: PersistenceMode,
    pub queue: String,
    pub workers: usize,
    pub units_enqueued: u64,
    pub units_inline: u64,
    pub rows_inserted: u64,
    pub duplicates_ignored: u64,
    pub rows_evicted: u64,
    pub batches_dropped: u64,
    pub fallbacks: u64,
    pub in_flight: usize,
    /// Queued units not yet written by a worker.
    pub held: usize,
    /// None while the queue is unreachable.
    pub queue_depth: Option<usize>,
}

struct Inner {
    queue: Arc<dyn WorkQueue>,
    sink: Arc<dyn MessageSink>,
    settings: PersistenceSettings,
    errors: Arc<ErrorCounters>,
    queued: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    outbox: Mutex<HashMap<String, VecDeque<FlushUnit>>>,
    wake: Notify,
    in_flight: AtomicUsize,
    units_enqueued: AtomicU64,
    units_inline: AtomicU64,
    rows_inserted: AtomicU64,
    duplicates: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
    fallbacks: AtomicU64,
}

#[derive(Clone)]
pub struct PersistenceQueue {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PersistenceQueue {
    /// Start the puller and `settings.workers` shard workers.
    pub fn start(
        queue: Arc<dyn WorkQueue>,
        sink: Arc<dyn MessageSink>,
        settings: PersistenceSettings,
        errors: Arc<ErrorCounters>,
    ) -> Self {
        let workers = settings.workers.max(1);
        let inner = Arc::new(Inner {
            queue,
            sink,
            settings,
            errors,
            queued: AtomicBool::new(true),
            last_probe: Mutex::new(None),
            outbox: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            in_flight: AtomicUsize::new(0),
            units_enqueued: AtomicU64::new(0),
            units_inline: AtomicU64::new(0),
            rows_inserted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        });
        let (stop, _) = watch::channel(false);

        let mut tasks = Vec::with_capacity(workers + 1);
        let mut shards = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(SHARD_BUFFER);
            shards.push(tx);
            tasks.push(tokio::spawn(shard_worker(inner.clone(), shard, rx)));
        }
        tasks.push(tokio::spawn(puller(inner.clone(), shards, stop.subscribe())));
        info!("[persist] Started {} workers on queue {}", workers, inner.queue.name());

        PersistenceQueue { inner, stop, tasks: Arc::new(Mutex::new(tasks)) }
    }

    pub fn mode(&self) -> PersistenceMode {
        if self.inner.queued.load(Ordering::SeqCst) {
            PersistenceMode::Queued
        } else {
            PersistenceMode::Inline
        }
    }

    /// Hand a unit to the queue, or write it inline when the queue is down.
    /// Returns the inline write report, None when the unit was queued.
    pub async fn submit(&self, unit: FlushUnit) -> Option<WriteReport> {
        if unit.messages.is_empty() {
            return None;
        }
        let inner = &self.inner;
        if !inner.queued.load(Ordering::SeqCst) {
            inner.probe_if_due().await;
        }

        if inner.queued.load(Ordering::SeqCst) {
            inner.hold(&unit);
            match inner.bounded("enqueue", inner.queue.enqueue(&unit)).await {
                Ok(()) => {
                    inner.units_enqueued.fetch_add(1, Ordering::Relaxed);
                    inner.wake.notify_one();
                    return None;
                }
                Err(e) => {
                    inner.release(&unit.stream_id, &unit.unit_id);
                    inner.fall_back(&e);
                }
            }
        }

        let earlier = inner.take_held(&unit.stream_id);
        if !earlier.is_empty() {
            debug!("[persist] Writing {} queued units of {} inline first", earlier.len(), unit.stream_id);
            for held in earlier {
                inner.write(held).await;
            }
        }
        inner.units_inline.fetch_add(1, Ordering::Relaxed);
        inner.write(unit).await
    }

    /// Wait until nothing is queued or in flight. False on timeout.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.idle().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.inner.wake.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drain what is queued (bounded by `timeout`), then stop the workers.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.settle(timeout).await {
            warn!("[persist] Shutdown with units still queued; they stay durable for the next start");
        }
        self.stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("[persist] Stopped");
    }

    pub async fn stats(&self) -> PersistenceStats {
        let inner = &self.inner;
        let queue_depth = match self.mode() {
            PersistenceMode::Queued => inner.bounded("depth", inner.queue.depth()).await.ok(),
            PersistenceMode::Inline => None,
        };
        PersistenceStats {
            mode: self.mode(),
            queue: inner.queue.name().to_string(),
            workers: inner.settings.workers.max(1),
            units_enqueued: inner.units_enqueued.load(Ordering::Relaxed),
            units_inline: inner.units_inline.load(Ordering::Relaxed),
            rows_inserted: inner.rows_inserted.load(Ordering::Relaxed),
            duplicates_ignored: inner.duplicates.load(Ordering::Relaxed),
            rows_evicted: inner.evicted.load(Ordering::Relaxed),
            batches_dropped: inner.dropped.load(Ordering::Relaxed),
            fallbacks: inner.fallbacks.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::SeqCst),
            held: inner.outbox.lock().values().map(VecDeque::len).sum(),
            queue_depth,
        }
    }
}

impl Inner {
    /// Run one queue call, treating a backend that stalls past
    /// `queue_timeout` as unreachable.
    async fn bounded<T>(&self, op: &str, call: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
        let limit = self.settings.queue_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::QueueUnavailable(format!(
                "{} {} gave no answer within {:?}",
                self.queue.name(),
                op,
                limit
            ))),
        }
    }

    // ── Outbox ─────────────────────────────────────────────────────────

    fn hold(&self, unit: &FlushUnit) {
        self.outbox.lock().entry(unit.stream_id.clone()).or_default().push_back(unit.clone());
    }

    fn release(&self, stream_id: &str, unit_id: &str) {
        let mut outbox = self.outbox.lock();
        if let Some(units) = outbox.get_mut(stream_id) {
            units.retain(|u| u.unit_id != unit_id);
            if units.is_empty() {
                outbox.remove(stream_id);
            }
        }
    }

    /// Everything the stream still holds, oldest first.
    fn take_held(&self, stream_id: &str) -> Vec<FlushUnit> {
        self.outbox.lock().remove(stream_id).map(Vec::from).unwrap_or_default()
    }

    fn fall_back(&self, e: &EngineError) {
        self.errors.record(ErrorClass::QueueUnavailable);
        if self.queued.swap(false, Ordering::SeqCst) {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            warn!("[persist] Queue {} unavailable, writing inline: {}", self.queue.name(), e);
        }
        *self.last_probe.lock() = Some(Instant::now());
    }

    /// Ping the queue when the probe interval has elapsed; switch back to
    /// queued mode if it answers.
    async fn probe_if_due(&self) {
        let due = {
            let mut last = self.last_probe.lock();
            let now = Instant::now();
            match *last {
                Some(at) if now.saturating_duration_since(at) < self.settings.queue_probe() => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if !due {
            return;
        }
        match self.bounded("ping", self.queue.ping()).await {
            Ok(()) => {
                if !self.queued.swap(true, Ordering::SeqCst) {
                    info!("[persist] Queue {} reachable again, back to queued writes", self.queue.name());
                    self.wake.notify_one();
                }
            }
            Err(e) => debug!("[persist] Queue probe failed: {}", e),
        }
    }

    async fn idle(&self) -> bool {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if !self.queued.load(Ordering::SeqCst) {
            return true;
        }
        match self.bounded("depth", self.queue.depth()).await {
            Ok(depth) => depth == 0 && self.in_flight.load(Ordering::SeqCst) == 0,
            Err(_) => true,
        }
    }

    /// Write one unit, retrying pool exhaustion. Failures are counted and
    /// the batch is dropped.
    async fn write(&self, unit: FlushUnit) -> Option<WriteReport> {
        let FlushUnit { unit_id, stream_id, messages, .. } = unit;
        let count = messages.len();
        let mut attempt = 0;
        loop {
            match self.sink.write_batch(&stream_id, messages.clone()).await {
                Ok(report) => {
                    self.rows_inserted.fetch_add(report.inserted.len() as u64, Ordering::Relaxed);
                    self.duplicates.fetch_add(report.duplicates as u64, Ordering::Relaxed);
                    self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
                    debug!(
                        "[persist] {} → {} rows ({} duplicate) for {}",
                        unit_id,
                        report.inserted.len(),
                        report.duplicates,
                        stream_id
                    );
                    return Some(report);
                }
                Err(e @ EngineError::PoolExhausted { .. }) if attempt < POOL_RETRIES => {
                    attempt += 1;
                    debug!("[persist] {} (attempt {}/{})", e, attempt, POOL_RETRIES);
                    tokio::time::sleep(POOL_BACKOFF * attempt).await;
                }
                Err(e) => {
                    self.errors.record(ErrorClass::Persistence);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    error!("[persist] Dropped batch {} ({} messages for {}): {}", unit_id, count, stream_id, e);
                    return None;
                }
            }
        }
    }
}

fn shard_of(stream_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    stream_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

// ── Tasks ──────────────────────────────────────────────────────────────────

async fn puller(inner: Arc<Inner>, shards: Vec<mpsc::Sender<Lease>>, mut stop: watch::Receiver<bool>) {
    let batch = shards.len() * 4;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(PULL_INTERVAL) => {}
        }
        if *stop.borrow() {
            break;
        }
        if !inner.queued.load(Ordering::SeqCst) {
            inner.probe_if_due().await;
            continue;
        }

        let leases = match inner.bounded("lease", inner.queue.lease(batch, inner.settings.lease())).await {
            Ok(leases) => leases,
            Err(e) => {
                inner.fall_back(&e);
                continue;
            }
        };
        let full = leases.len() == batch;
        for lease in leases {
            let shard = shard_of(&lease.unit.stream_id, shards.len());
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            if shards[shard].send(lease).await.is_err() {
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
        if full {
            inner.wake.notify_one();
        }
    }
    debug!("[persist] Puller stopped");
}

async fn shard_worker(inner: Arc<Inner>, shard: usize, mut rx: mpsc::Receiver<Lease>) {
    while let Some(lease) = rx.recv().await {
        if lease.attempts > 1 {
            debug!("[persist] Redelivered {} (attempt {})", lease.unit.unit_id, lease.attempts);
        }
        let (stream_id, unit_id) = (lease.unit.stream_id.clone(), lease.unit.unit_id.clone());
        inner.write(lease.unit).await;
        inner.release(&stream_id, &unit_id);
        if let Err(e) = inner.bounded("ack", inner.queue.ack(&lease.lease_id)).await {
            // Unacked units reappear after the lease; rewriting them is harmless
            warn!("[persist] Ack failed for {}: {}", lease.lease_id, e);
        }
        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("[persist] Worker {} stopped", shard);
}
