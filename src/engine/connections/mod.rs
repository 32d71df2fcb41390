// Chorus Engine — Connection Lifecycle Manager
//
// One driver task per (platform, channel). The manager owns the registry;
// drivers own the upstream session and report through a single event
// channel read by the pipeline.
//
//   Disconnected → Connecting → Live ⇄ Retrying → Disconnected (terminal)
//
// Teardown rule: whoever removes an entry from the registry emits its
// Disconnected event and deletes its checkpoint. Removal happens once, so
// every connection ends with exactly one Disconnected event.
//
// Module layout:
//   driver — per-connection task (open, read, backoff, checkpoint)
//   quota  — provider call-volume projection

mod driver;
pub mod quota;

use crate::config::ConnectionSettings;
use crate::engine::platforms::PlatformRegistry;
use chorus_core::atoms::traits::CheckpointStore;
use chorus_core::{
    new_connection_id, stream_id_of, ChannelKey, Checkpoint, ConnectionState, DisconnectReason,
    EngineError, EngineResult, RawEvent, SessionCursor,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use quota::QuotaUsage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long a disconnect waits for the driver to wind down before aborting it.
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ── Public types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub key: ChannelKey,
    pub stream_id: String,
}

impl ConnectionHandle {
    fn new(connection_id: String, key: ChannelKey) -> Self {
        let stream_id = key.stream_id();
        ConnectionHandle { connection_id, key, stream_id }
    }
}

/// Everything drivers report to the pipeline.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A fresh connection went Live for the first time. Resumed connections
    /// stay silent.
    Connected { connection_id: String, key: ChannelKey },
    Messages { connection_id: String, key: ChannelKey, events: Vec<RawEvent> },
    StateChanged { connection_id: String, state: ConnectionState },
    Retrying { connection_id: String, attempt: u32, delay: Duration, error: String },
    QuotaWarning { connection_id: String, usage: QuotaUsage },
    Disconnected { connection_id: String, key: ChannelKey, reason: DisconnectReason },
}

/// Introspection snapshot of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub key: ChannelKey,
    pub stream_id: String,
    pub state: ConnectionState,
    pub retries: u32,
    pub resumed: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    pub poll_interval_ms: Option<u64>,
    pub messages: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub quota: Option<QuotaUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connection_id: String,
    pub state: ConnectionState,
    pub healthy: bool,
    pub issue: Option<String>,
}

// ── Registry ───────────────────────────────────────────────────────────────

struct Status {
    state: ConnectionState,
    retries: u32,
    last_activity: DateTime<Utc>,
    last_poll: Option<DateTime<Utc>>,
    poll_interval: Option<Duration>,
    messages: u64,
    errors: u64,
    last_error: Option<String>,
    last_message_id: Option<String>,
    cursor: SessionCursor,
    quota: Option<QuotaUsage>,
}

pub(crate) struct ConnectionEntry {
    handle: ConnectionHandle,
    resumed: bool,
    created_at: DateTime<Utc>,
    status: Mutex<Status>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionEntry {
    fn new(handle: ConnectionHandle, resume: Option<&Checkpoint>) -> (Arc<Self>, watch::Receiver<bool>) {
        let (cancel, cancel_rx) = watch::channel(false);
        let now = Utc::now();
        let entry = ConnectionEntry {
            handle,
            resumed: resume.is_some(),
            created_at: now,
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                retries: 0,
                last_activity: now,
                last_poll: None,
                poll_interval: None,
                messages: 0,
                errors: 0,
                last_error: None,
                last_message_id: resume.and_then(|cp| cp.last_message_id.clone()),
                cursor: resume.map(|cp| cp.cursor.clone()).unwrap_or_default(),
                quota: None,
            }),
            cancel,
            task: Mutex::new(None),
        };
        (Arc::new(entry), cancel_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().state = state;
    }

    fn mark_live(&self) {
        let mut s = self.status.lock();
        s.state = ConnectionState::Live;
        s.retries = 0;
        s.last_activity = Utc::now();
    }

    /// Count a failure; returns the new consecutive retry count.
    fn record_failure(&self, error: &EngineError) -> u32 {
        let mut s = self.status.lock();
        s.retries += 1;
        s.errors += 1;
        s.last_error = Some(error.to_string());
        s.retries
    }

    fn record_messages(&self, count: usize, last_id: Option<String>, cursor: SessionCursor) {
        let mut s = self.status.lock();
        s.messages += count as u64;
        s.last_activity = Utc::now();
        if last_id.is_some() {
            s.last_message_id = last_id;
        }
        s.cursor = cursor;
    }

    fn record_poll(&self, interval: Duration, quota: QuotaUsage) {
        let mut s = self.status.lock();
        s.last_poll = Some(Utc::now());
        s.poll_interval = Some(interval);
        s.quota = Some(quota);
    }

    fn checkpoint(&self) -> Checkpoint {
        let s = self.status.lock();
        Checkpoint {
            connection_id: self.handle.connection_id.clone(),
            platform: self.handle.key.platform,
            channel: self.handle.key.channel.clone(),
            cursor: s.cursor.clone(),
            last_message_id: s.last_message_id.clone(),
            saved_at: Utc::now(),
        }
    }

    fn info(&self) -> ConnectionInfo {
        let s = self.status.lock();
        ConnectionInfo {
            connection_id: self.handle.connection_id.clone(),
            key: self.handle.key.clone(),
            stream_id: self.handle.stream_id.clone(),
            state: s.state,
            retries: s.retries,
            resumed: self.resumed,
            created_at: self.created_at,
            last_activity: s.last_activity,
            last_poll: s.last_poll,
            poll_interval_ms: s.poll_interval.map(|d| d.as_millis() as u64),
            messages: s.messages,
            errors: s.errors,
            last_error: s.last_error.clone(),
            quota: s.quota,
        }
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Arc<ConnectionEntry>>,
    by_channel: HashMap<ChannelKey, String>,
}

impl Registry {
    fn insert(&mut self, entry: Arc<ConnectionEntry>) {
        self.by_channel.insert(entry.handle.key.clone(), entry.handle.connection_id.clone());
        self.by_id.insert(entry.handle.connection_id.clone(), entry);
    }

    fn remove(&mut self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        let entry = self.by_id.remove(connection_id)?;
        if self.by_channel.get(&entry.handle.key).map(String::as_str) == Some(connection_id) {
            self.by_channel.remove(&entry.handle.key);
        }
        Some(entry)
    }
}

pub(crate) struct Shared {
    settings: ConnectionSettings,
    connectors: PlatformRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    events: mpsc::Sender<ConnectionEvent>,
    registry: Mutex<Registry>,
}

impl Shared {
    /// Terminal teardown from inside a driver. The driver exits right after,
    /// so there is no task to wait for.
    async fn finish(&self, connection_id: &str, reason: DisconnectReason) {
        let entry = self.registry.lock().remove(connection_id);
        if let Some(entry) = entry {
            self.release(&entry, reason).await;
        }
    }

    async fn release(&self, entry: &ConnectionEntry, reason: DisconnectReason) {
        entry.set_state(ConnectionState::Disconnected);
        let id = &entry.handle.connection_id;
        if let Err(e) = self.checkpoints.delete(id).await {
            warn!("[conn] Failed to delete checkpoint for {}: {}", id, e);
        }
        info!("[conn] {} disconnected ({})", id, reason);
        let _ = self
            .events
            .send(ConnectionEvent::Disconnected {
                connection_id: id.clone(),
                key: entry.handle.key.clone(),
                reason,
            })
            .await;
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connectors: PlatformRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, rx) = mpsc::channel(settings.event_buffer.max(1));
        let shared = Shared { settings, connectors, checkpoints, events, registry: Mutex::new(Registry::default()) };
        (ConnectionManager { shared: Arc::new(shared) }, rx)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    /// Idempotent per channel: an active channel returns its existing handle.
    pub fn connect(&self, key: ChannelKey) -> EngineResult<ConnectionHandle> {
        if self.shared.connectors.get(key.platform).is_none() {
            return Err(EngineError::Config(format!("platform {} is not enabled", key.platform)));
        }

        let (entry, cancel_rx) = {
            let mut registry = self.shared.registry.lock();
            if let Some(existing) = registry.by_channel.get(&key).and_then(|id| registry.by_id.get(id)) {
                return Ok(existing.handle.clone());
            }
            let handle = ConnectionHandle::new(new_connection_id(&key, Utc::now()), key);
            let (entry, cancel_rx) = ConnectionEntry::new(handle, None);
            registry.insert(Arc::clone(&entry));
            (entry, cancel_rx)
        };

        info!("[conn] Connecting {} as {}", entry.handle.key, entry.handle.connection_id);
        self.spawn_driver(Arc::clone(&entry), cancel_rx, None);
        Ok(entry.handle.clone())
    }

    /// Resume connections from fresh checkpoints; stale or unusable ones are
    /// deleted.
    pub async fn restore(&self) -> EngineResult<Vec<ConnectionHandle>> {
        let now = Utc::now();
        let freshness = self.shared.settings.checkpoint_freshness_secs as i64;
        let mut restored = Vec::new();

        for cp in self.shared.checkpoints.load_all().await? {
            let usable = cp.age_secs(now) <= freshness && self.shared.connectors.get(cp.platform).is_some();
            let key = match cp.channel_key() {
                Ok(key) if usable => key,
                _ => {
                    info!("[conn] Discarding checkpoint {} (age {}s)", cp.connection_id, cp.age_secs(now));
                    self.shared.checkpoints.delete(&cp.connection_id).await?;
                    continue;
                }
            };

            let spawned = {
                let mut registry = self.shared.registry.lock();
                if registry.by_channel.contains_key(&key) || registry.by_id.contains_key(&cp.connection_id) {
                    None
                } else {
                    let handle = ConnectionHandle::new(cp.connection_id.clone(), key);
                    let (entry, cancel_rx) = ConnectionEntry::new(handle, Some(&cp));
                    registry.insert(Arc::clone(&entry));
                    Some((entry, cancel_rx))
                }
            };

            match spawned {
                Some((entry, cancel_rx)) => {
                    info!("[conn] Resuming {} from checkpoint", cp.connection_id);
                    restored.push(entry.handle.clone());
                    self.spawn_driver(entry, cancel_rx, Some(cp));
                }
                None => {
                    self.shared.checkpoints.delete(&cp.connection_id).await?;
                }
            }
        }
        Ok(restored)
    }

    fn spawn_driver(&self, entry: Arc<ConnectionEntry>, cancel: watch::Receiver<bool>, resume: Option<Checkpoint>) {
        let driver = driver::Driver::new(Arc::clone(&self.shared), Arc::clone(&entry), cancel, resume);
        let task = tokio::spawn(driver.run());
        *entry.task.lock() = Some(task);
    }

    /// Cancel timers, release the session, delete the checkpoint and emit a
    /// Disconnected event. Returns false when the connection was not active.
    pub async fn disconnect(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        let entry = self.shared.registry.lock().remove(connection_id);
        let Some(entry) = entry else {
            return false;
        };

        entry.cancel.send_replace(true);
        let task = entry.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("[conn] Driver for {} did not stop in time, aborting", connection_id);
                task.abort();
            }
        }
        self.shared.release(&entry, reason).await;
        true
    }

    /// Disconnect everything with reason `shutdown`.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.shared.registry.lock().by_id.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.disconnect(&id, DisconnectReason::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn is_active(&self, connection_id: &str) -> bool {
        self.shared.registry.lock().by_id.contains_key(connection_id)
    }

    pub fn lookup(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.shared.registry.lock().by_id.get(connection_id).map(|e| e.handle.clone())
    }

    /// The active connection feeding `stream_id`, if any.
    pub fn for_stream(&self, stream_id: &str) -> Option<ConnectionHandle> {
        let registry = self.shared.registry.lock();
        registry
            .by_id
            .values()
            .find(|e| e.handle.stream_id == stream_id)
            .map(|e| e.handle.clone())
    }

    /// Resolve a connection id, falling back to its stream when the exact
    /// connection has been replaced.
    pub fn resolve(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.lookup(connection_id).or_else(|| stream_id_of(connection_id).and_then(|s| self.for_stream(s)))
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.shared.registry.lock().by_id.values().map(|e| e.info()).collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    /// Poll-based connections that have not polled within twice their
    /// interval are reported as stalled.
    pub fn health(&self) -> Vec<ConnectionHealth> {
        let now = Utc::now();
        let default_poll = Duration::from_millis(self.shared.settings.default_poll_ms);
        self.list()
            .into_iter()
            .map(|info| {
                let issue = match info.state {
                    ConnectionState::Retrying => Some(format!("retrying (attempt {})", info.retries)),
                    ConnectionState::Live if info.key.platform.is_poll_based() => {
                        let interval = info.poll_interval_ms.map(Duration::from_millis).unwrap_or(default_poll);
                        let since = info.last_poll.unwrap_or(info.last_activity);
                        let idle = (now - since).to_std().unwrap_or_default();
                        (idle > interval * 2).then(|| format!("stalled polling ({}s since last poll)", idle.as_secs()))
                    }
                    _ => None,
                };
                ConnectionHealth {
                    connection_id: info.connection_id,
                    state: info.state,
                    healthy: issue.is_none(),
                    issue,
                }
            })
            .collect()
    }

    /// Periodic connector housekeeping.
    pub fn maintain(&self) {
        for connector in self.shared.connectors.all() {
            connector.maintain();
        }
    }
}
