// Chorus Engine — Orchestrator
//
// The Engine wires the pieces together and exposes the collaborator API.
// One pipeline lock serializes message handling, which keeps each stream in
// arrival order from moderation through batching to persistence:
//
//   RawEvent → normalize → dedupe → moderate → (not spam) broadcast + batch
//            → flush unit → persistence queue
//
// Background work: the connection event pump, plus one housekeeping loop for
// batch deadlines, threshold recomputation, heartbeats, inactivity sweeps,
// metrics and connector maintenance.

use crate::config::{ChorusConfig, QueueBackend};
use crate::engine::batch::BatchAccumulator;
use crate::engine::connections::{ConnectionEvent, ConnectionHandle, ConnectionManager};
use crate::engine::hub::{Hub, Subscriber};
use crate::engine::persistence::PersistenceQueue;
use crate::engine::platforms::PlatformRegistry;
use crate::engine::stats::{EngineStats, ErrorCounters, MessageCounters, MetricsSnapshot};
use chorus_core::atoms::constants::{FLUSH_QUEUE_NAME, REPUTATION_HISTORY_LEN};
use chorus_core::atoms::traits::{CheckpointStore, MessageSink, WorkQueue};
use chorus_core::moderation::reputation::ReputationView;
use chorus_core::moderation::Moderator;
use chorus_core::store::{MemoryWorkQueue, MessageStore, SqliteCheckpointStore, SqliteWorkQueue, StorePool};
use chorus_core::{
    CanonicalMessage, ChannelKey, DisconnectReason, EngineError, EngineResult, ErrorClass, FlushUnit,
    Normalize, Platform, RawEvent,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const RECOMPUTE_TICK: Duration = Duration::from_secs(1);
const MAINTENANCE_TICK: Duration = Duration::from_secs(60);
const PERSISTENCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Dependencies ───────────────────────────────────────────────────────────

/// Collaborators the engine runs against.
pub struct EngineDeps {
    pub connectors: PlatformRegistry,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub sink: Arc<dyn MessageSink>,
}

impl EngineDeps {
    /// Production wiring: the SQLite store at the configured path and the
    /// enabled platform connectors. The message store is returned too, for
    /// history queries.
    pub fn from_config(config: &ChorusConfig) -> EngineResult<(Self, Arc<MessageStore>)> {
        let settings = &config.persistence;
        let path = settings.database_path();
        let pool = Arc::new(StorePool::open(&path, settings.pool_size, settings.pool_timeout())?);
        info!("[engine] Store at {}", path.display());

        let store = Arc::new(MessageStore::new(Arc::clone(&pool), settings.retention()));
        let queue: Arc<dyn WorkQueue> = match settings.queue {
            QueueBackend::Sqlite => Arc::new(SqliteWorkQueue::new(Arc::clone(&pool), FLUSH_QUEUE_NAME)),
            QueueBackend::Memory => Arc::new(MemoryWorkQueue::new(FLUSH_QUEUE_NAME)),
        };
        let deps = EngineDeps {
            connectors: PlatformRegistry::from_settings(&config.platforms)?,
            checkpoints: Arc::new(SqliteCheckpointStore::new(pool)),
            queue,
            sink: store.clone(),
        };
        Ok((deps, store))
    }
}

// ── Ingest outcome ─────────────────────────────────────────────────────────

/// What happened to one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Broadcast and batched for persistence.
    Accepted { message: Arc<CanonicalMessage>, listeners: usize },
    /// Classified spam; only the sender's reputation changed.
    Spam { identity: String, reputation: i64 },
    /// Id already seen on this stream.
    Duplicate,
    /// Nothing classifiable (empty text, missing sender).
    Invalid,
    /// No active connection with that id.
    Orphaned,
}

// ── Pipeline state ─────────────────────────────────────────────────────────

/// Bounded window of recently seen message ids for one stream.
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        SeenIds { order: VecDeque::new(), ids: HashSet::new(), capacity: capacity.max(1) }
    }

    /// False when `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct Pipeline {
    batches: BatchAccumulator,
    seen: HashMap<String, SeenIds>,
}

// ── Engine ─────────────────────────────────────────────────────────────────

struct EngineInner {
    config: ChorusConfig,
    started_at: DateTime<Utc>,
    connections: ConnectionManager,
    moderator: Moderator,
    hub: Hub,
    persistence: PersistenceQueue,
    pipeline: tokio::sync::Mutex<Pipeline>,
    counters: MessageCounters,
    errors: Arc<ErrorCounters>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start background tasks and resume connections from fresh checkpoints.
    pub async fn start(config: ChorusConfig, deps: EngineDeps) -> EngineResult<Self> {
        let errors = Arc::new(ErrorCounters::new());
        let (connections, events) =
            ConnectionManager::new(config.connection.clone(), deps.connectors, deps.checkpoints);
        let persistence =
            PersistenceQueue::start(deps.queue, deps.sink, config.persistence.clone(), Arc::clone(&errors));
        let inner = Arc::new(EngineInner {
            started_at: Utc::now(),
            moderator: Moderator::new(config.classifier.clone(), config.scoring.clone()),
            hub: Hub::new(config.hub.listener_buffer, Arc::clone(&errors)),
            pipeline: tokio::sync::Mutex::new(Pipeline {
                batches: BatchAccumulator::new(config.batch.size, config.batch.interval()),
                seen: HashMap::new(),
            }),
            counters: MessageCounters::default(),
            stop: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
            connections,
            persistence,
            errors,
            config,
        });
        let engine = Engine { inner };

        let pump = tokio::spawn(engine.clone().pump(events, engine.inner.stop.subscribe()));
        let housekeeping = tokio::spawn(engine.clone().housekeeping(engine.inner.stop.subscribe()));
        engine.inner.tasks.lock().extend([pump, housekeeping]);

        let restored = match engine.inner.connections.restore().await {
            Ok(restored) => restored,
            Err(e) => {
                warn!("[engine] Could not restore checkpoints: {}", e);
                Vec::new()
            }
        };
        for handle in &restored {
            engine.inner.hub.touch(&handle.stream_id);
        }
        info!("[engine] Started ({} connections resumed)", restored.len());
        Ok(engine)
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.inner.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    // ── Connections ────────────────────────────────────────────────────

    pub fn connect(&self, platform: Platform, channel: &str) -> EngineResult<ConnectionHandle> {
        let handle = self.inner.connections.connect(ChannelKey::new(platform, channel)?)?;
        self.inner.hub.touch(&handle.stream_id);
        Ok(handle)
    }

    pub async fn disconnect(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        self.inner.connections.disconnect(connection_id, reason).await
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    /// Listen to the stream an active connection feeds.
    pub fn subscribe(&self, connection_id: &str) -> EngineResult<Subscriber> {
        let handle = self
            .inner
            .connections
            .resolve(connection_id)
            .ok_or_else(|| EngineError::NotFound(format!("connection {}", connection_id)))?;
        Ok(self.inner.hub.subscribe(&handle.stream_id))
    }

    /// Listen to a stream by id, whether or not it is connected yet.
    pub fn subscribe_stream(&self, stream_id: &str) -> Subscriber {
        self.inner.hub.subscribe(stream_id)
    }

    pub fn unsubscribe(&self, connection_id: &str, listener_id: &str) -> bool {
        let stream_id = match self.inner.connections.resolve(connection_id) {
            Some(handle) => handle.stream_id,
            None => match chorus_core::stream_id_of(connection_id) {
                Some(stream) => stream.to_string(),
                None => connection_id.to_string(),
            },
        };
        self.inner.hub.unsubscribe(&stream_id, listener_id)
    }

    /// Periodic metrics snapshots for operational observers.
    pub fn observe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.inner.hub.observe()
    }

    // ── Reputation ─────────────────────────────────────────────────────

    pub fn reputation(&self, identity: &str) -> ReputationView {
        self.inner.moderator.reputation().view(identity, REPUTATION_HISTORY_LEN)
    }

    pub fn reset_reputation(&self, identity: &str) -> bool {
        self.inner.moderator.reputation().reset(identity)
    }

    pub fn moderator(&self) -> &Moderator {
        &self.inner.moderator
    }

    // ── Pipeline ───────────────────────────────────────────────────────

    /// Run one raw event through the pipeline for an active connection.
    pub async fn ingest(&self, connection_id: &str, event: RawEvent) -> Ingested {
        let inner = &self.inner;
        MessageCounters::bump(&inner.counters.received);
        let Some(handle) = inner.connections.lookup(connection_id) else {
            MessageCounters::bump(&inner.counters.orphaned_dropped);
            warn!("[engine] Dropped message for inactive connection {}", connection_id);
            return Ingested::Orphaned;
        };
        let mut pipeline = inner.pipeline.lock().await;
        self.process(&mut pipeline, &handle.key, event).await
    }

    async fn process(&self, pipeline: &mut Pipeline, key: &ChannelKey, event: RawEvent) -> Ingested {
        let inner = &self.inner;
        let Some(draft) = event.normalize() else {
            inner.errors.record(ErrorClass::ClassificationInput);
            MessageCounters::bump(&inner.counters.invalid_dropped);
            return Ingested::Invalid;
        };

        let stream_id = key.stream_id();
        let window = inner.config.hub.dedupe_window;
        if !pipeline.seen.entry(stream_id.clone()).or_insert_with(|| SeenIds::new(window)).insert(&draft.id) {
            MessageCounters::bump(&inner.counters.duplicates_dropped);
            debug!("[engine] Duplicate {} on {}", draft.id, stream_id);
            return Ingested::Duplicate;
        }

        let (message, assessment) = match inner.moderator.moderate(key, draft) {
            Ok(result) => result,
            Err(e) => {
                inner.errors.record(e.class());
                MessageCounters::bump(&inner.counters.invalid_dropped);
                debug!("[engine] Unclassifiable message on {}: {}", stream_id, e);
                return Ingested::Invalid;
            }
        };
        MessageCounters::bump(&inner.counters.processed);

        if message.is_spam {
            MessageCounters::bump(&inner.counters.spam_dropped);
            debug!("[engine] Spam from {} on {} dropped", message.identity, stream_id);
            return Ingested::Spam { identity: message.identity, reputation: assessment.reputation };
        }
        if message.is_question {
            MessageCounters::bump(&inner.counters.questions);
        }

        let message = Arc::new(message);
        let listeners = inner.hub.broadcast(Arc::clone(&message));
        MessageCounters::bump(&inner.counters.broadcast);

        if let Some(unit) = pipeline.batches.push(message.as_ref().clone(), Instant::now()) {
            self.submit(unit).await;
        }
        Ingested::Accepted { message, listeners }
    }

    async fn submit(&self, unit: FlushUnit) {
        debug!("[engine] Flushing {} messages for {}", unit.messages.len(), unit.stream_id);
        self.inner.persistence.submit(unit).await;
    }

    /// Hand every pending batch to persistence. Returns the number of units.
    pub async fn flush(&self) -> usize {
        let mut pipeline = self.inner.pipeline.lock().await;
        let units = pipeline.batches.drain_all();
        let count = units.len();
        for unit in units {
            self.submit(unit).await;
        }
        count
    }

    /// Flush, then wait until persistence has written everything queued.
    pub async fn settle(&self, timeout: Duration) -> bool {
        self.flush().await;
        self.inner.persistence.settle(timeout).await
    }

    async fn flush_due(&self) {
        let mut pipeline = self.inner.pipeline.lock().await;
        for unit in pipeline.batches.due(Instant::now()) {
            self.submit(unit).await;
        }
    }

    // ── Connection events ──────────────────────────────────────────────

    async fn pump(self, mut events: mpsc::Receiver<ConnectionEvent>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = stop.changed() => {
                    // Disconnect events from shutdown are already queued
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event).await;
                    }
                    break;
                }
            }
        }
        debug!("[engine] Event pump stopped");
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        let inner = &self.inner;
        match event {
            ConnectionEvent::Connected { connection_id, key } => {
                info!("[engine] {} live as {}", key, connection_id);
                inner.hub.touch(&key.stream_id());
            }
            ConnectionEvent::Messages { connection_id, key, events } => {
                if !inner.connections.is_active(&connection_id) {
                    for _ in &events {
                        MessageCounters::bump(&inner.counters.received);
                        MessageCounters::bump(&inner.counters.orphaned_dropped);
                    }
                    warn!("[engine] Dropped {} messages for inactive connection {}", events.len(), connection_id);
                    return;
                }
                let mut pipeline = inner.pipeline.lock().await;
                for event in events {
                    MessageCounters::bump(&inner.counters.received);
                    self.process(&mut pipeline, &key, event).await;
                }
            }
            ConnectionEvent::StateChanged { connection_id, state } => {
                debug!("[engine] {} → {}", connection_id, state.as_str());
            }
            ConnectionEvent::Retrying { connection_id, attempt, delay, error } => {
                inner.errors.record(ErrorClass::Connection);
                warn!("[engine] {} retry {} in {:?}: {}", connection_id, attempt, delay, error);
            }
            ConnectionEvent::QuotaWarning { connection_id, usage } => {
                inner.errors.record(ErrorClass::QuotaWarning);
                warn!(
                    "[engine] {} projected at {}/{} calls per day",
                    connection_id, usage.projected_daily, usage.ceiling
                );
            }
            ConnectionEvent::Disconnected { connection_id, key, reason } => {
                let stream_id = key.stream_id();
                {
                    let mut pipeline = inner.pipeline.lock().await;
                    if let Some(unit) = pipeline.batches.drain_stream(&stream_id) {
                        self.submit(unit).await;
                    }
                    pipeline.seen.remove(&stream_id);
                }
                // A newer connection may already feed this stream
                if inner.connections.for_stream(&stream_id).is_none() {
                    inner.hub.close_stream(&stream_id, reason.as_str());
                }
                info!("[engine] {} ended ({})", connection_id, reason);
            }
        }
    }

    // ── Housekeeping ───────────────────────────────────────────────────

    async fn housekeeping(self, mut stop: watch::Receiver<bool>) {
        let hub = &self.inner.config.hub;
        let batch_tick = (self.inner.config.batch.interval() / 4).max(Duration::from_millis(10));
        let inactivity = hub.inactivity();
        let sweep_tick = (inactivity / 10).clamp(Duration::from_secs(1), Duration::from_secs(60));

        let mut batches = tokio::time::interval(batch_tick);
        let mut recompute = tokio::time::interval(RECOMPUTE_TICK);
        let mut heartbeat = tokio::time::interval(hub.heartbeat());
        let mut sweep = tokio::time::interval(sweep_tick);
        let mut metrics = tokio::time::interval(hub.metrics_interval());
        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        for ticker in [&mut batches, &mut recompute, &mut heartbeat, &mut sweep, &mut metrics, &mut maintenance] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = batches.tick() => self.flush_due().await,
                _ = recompute.tick() => {
                    self.inner.moderator.classifier().recompute_if_due();
                }
                _ = heartbeat.tick() => {
                    let removed = self.inner.hub.heartbeat();
                    if removed > 0 {
                        debug!("[engine] Heartbeat removed {} listeners", removed);
                    }
                }
                _ = sweep.tick() => {
                    let closed = self.sweep_inactive(inactivity).await;
                    if closed > 0 {
                        debug!("[engine] Inactivity sweep closed {} upstreams", closed);
                    }
                }
                _ = metrics.tick() => {
                    if self.inner.hub.stats().observers > 0 {
                        let snapshot = self.stats().await.metrics();
                        self.inner.hub.publish_metrics(snapshot);
                    }
                }
                _ = maintenance.tick() => self.inner.connections.maintain(),
            }
        }
        debug!("[engine] Housekeeping stopped");
    }

    /// Tear down upstreams for streams with no traffic in `window`.
    pub async fn sweep_inactive(&self, window: Duration) -> usize {
        let idle = self.inner.hub.idle_streams(Instant::now(), window);
        let mut closed = 0;
        for stream_id in idle {
            self.inner.hub.forget(&stream_id);
            if let Some(handle) = self.inner.connections.for_stream(&stream_id) {
                info!("[engine] {} idle for {:?}, disconnecting", stream_id, window);
                if self.inner.connections.disconnect(&handle.connection_id, DisconnectReason::Inactive).await {
                    closed += 1;
                }
            }
        }
        closed
    }

    // ── Introspection ──────────────────────────────────────────────────

    pub async fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let pending_messages = inner.pipeline.lock().await.batches.pending();
        let now = Utc::now();
        EngineStats {
            generated_at: now,
            uptime_secs: (now - inner.started_at).num_seconds(),
            messages: inner.counters.snapshot(),
            connections: inner.connections.list(),
            health: inner.connections.health(),
            hub: inner.hub.stats(),
            persistence: inner.persistence.stats().await,
            pending_messages,
            classifier: inner.moderator.classifier().stats(),
            reputation: inner.moderator.reputation().stats(),
            moods: inner.moderator.moods().counts(),
            errors: inner.errors.snapshot(),
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// Disconnect everything, flush pending batches and drain persistence.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let closed = inner.connections.shutdown().await;
        inner.stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("[engine] Background task failed: {}", e);
            }
        }
        let flushed = self.flush().await;
        inner.persistence.shutdown(PERSISTENCE_DRAIN_TIMEOUT).await;
        info!("[engine] Shut down ({} connections closed, {} batches flushed)", closed, flushed);
    }
}
