// Chorus Engine — Fan-out Hub
//
// Registry of stream id → live listeners. Delivery is best-effort: a frame
// goes out with `try_send`, and a listener whose buffer is full or whose
// receiver is gone is removed on the spot. Nothing is buffered for streams
// without listeners.
//
// Liveness: each heartbeat sends a numbered Ping; a listener that has not
// answered the previous ping by the next heartbeat is removed.
// Operational observers get periodic metrics on a separate broadcast
// channel, never per-message events.

use crate::engine::stats::{ErrorCounters, MetricsSnapshot};
use chorus_core::{CanonicalMessage, EngineError};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const OBSERVER_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Message(Arc<CanonicalMessage>),
    /// Answer with `Subscriber::pong(seq)`.
    Ping(u64),
    /// The stream's upstream went away; no more frames follow.
    Closed { reason: String },
}

struct Listener {
    id: String,
    tx: mpsc::Sender<HubFrame>,
    pong: Arc<AtomicU64>,
    pinged: u64,
}

impl Listener {
    fn send(&self, frame: HubFrame) -> Result<(), EngineError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::delivery(&self.id, "buffer full"),
            mpsc::error::TrySendError::Closed(_) => EngineError::delivery(&self.id, "receiver dropped"),
        })
    }
}

/// Receiving end handed to a subscriber.
pub struct Subscriber {
    id: String,
    stream_id: String,
    rx: mpsc::Receiver<HubFrame>,
    pong: Arc<AtomicU64>,
}

impl Subscriber {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub async fn recv(&mut self) -> Option<HubFrame> {
        self.rx.recv().await
    }

    /// Next chat message, answering pings along the way. None once the
    /// stream closes or the listener was removed.
    pub async fn recv_message(&mut self) -> Option<Arc<CanonicalMessage>> {
        loop {
            match self.rx.recv().await? {
                HubFrame::Message(msg) => return Some(msg),
                HubFrame::Ping(seq) => self.pong(seq),
                HubFrame::Closed { .. } => return None,
            }
        }
    }

    /// Frames already buffered, without waiting.
    pub fn drain(&mut self) -> Vec<HubFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn pong(&self, seq: u64) {
        self.pong.fetch_max(seq, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub streams: usize,
    pub listeners: usize,
    pub delivered: u64,
    /// Messages for streams without listeners.
    pub discarded: u64,
    pub dead_listeners: u64,
    pub observers: usize,
}

pub struct Hub {
    buffer: usize,
    streams: RwLock<HashMap<String, Vec<Listener>>>,
    activity: RwLock<HashMap<String, Instant>>,
    metrics: broadcast::Sender<MetricsSnapshot>,
    errors: Arc<ErrorCounters>,
    next_listener: AtomicU64,
    next_ping: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
    dead: AtomicU64,
}

impl Hub {
    pub fn new(listener_buffer: usize, errors: Arc<ErrorCounters>) -> Self {
        let (metrics, _) = broadcast::channel(OBSERVER_BUFFER);
        Hub {
            buffer: listener_buffer.max(1),
            streams: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
            metrics,
            errors,
            next_listener: AtomicU64::new(1),
            next_ping: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            dead: AtomicU64::new(0),
        }
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    pub fn subscribe(&self, stream_id: &str) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = format!("listener-{}", self.next_listener.fetch_add(1, Ordering::Relaxed));
        let pong = Arc::new(AtomicU64::new(0));
        self.streams
            .write()
            .entry(stream_id.to_string())
            .or_default()
            .push(Listener { id: id.clone(), tx, pong: pong.clone(), pinged: 0 });
        debug!("[hub] {} subscribed to {}", id, stream_id);
        Subscriber { id, stream_id: stream_id.to_string(), rx, pong }
    }

    /// Remove one listener. The stream entry goes with its last listener.
    pub fn unsubscribe(&self, stream_id: &str, listener_id: &str) -> bool {
        let mut streams = self.streams.write();
        let Some(listeners) = streams.get_mut(stream_id) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != listener_id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            streams.remove(stream_id);
        }
        if removed {
            debug!("[hub] {} unsubscribed from {}", listener_id, stream_id);
        }
        removed
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.read().contains_key(stream_id)
    }

    pub fn listener_count(&self, stream_id: &str) -> usize {
        self.streams.read().get(stream_id).map_or(0, Vec::len)
    }

    // ── Delivery ───────────────────────────────────────────────────────

    /// Push to every listener of the message's stream. Returns how many
    /// listeners received it.
    pub fn broadcast(&self, message: Arc<CanonicalMessage>) -> usize {
        let stream_id = message.stream_id.clone();
        self.touch(&stream_id);

        let mut streams = self.streams.write();
        let Some(listeners) = streams.get_mut(&stream_id) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        let mut sent = 0;
        listeners.retain(|listener| match listener.send(HubFrame::Message(message.clone())) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(e) => {
                self.errors.record(e.class());
                self.dead.fetch_add(1, Ordering::Relaxed);
                warn!("[hub] Removed listener from {}: {}", stream_id, e);
                false
            }
        });
        if listeners.is_empty() {
            streams.remove(&stream_id);
        }
        self.delivered.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Probe every listener. Those that missed the previous ping, or cannot
    /// take this one, are removed. Returns the number removed.
    pub fn heartbeat(&self) -> usize {
        let seq = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let mut removed = 0;
        let mut streams = self.streams.write();
        for (stream_id, listeners) in streams.iter_mut() {
            listeners.retain_mut(|listener| {
                let answered = listener.pinged == 0 || listener.pong.load(Ordering::SeqCst) >= listener.pinged;
                let outcome = if answered {
                    listener.send(HubFrame::Ping(seq))
                } else {
                    Err(EngineError::delivery(&listener.id, "missed heartbeat"))
                };
                match outcome {
                    Ok(()) => {
                        listener.pinged = seq;
                        true
                    }
                    Err(e) => {
                        self.errors.record(e.class());
                        warn!("[hub] Removed listener from {}: {}", stream_id, e);
                        removed += 1;
                        false
                    }
                }
            });
        }
        streams.retain(|_, listeners| !listeners.is_empty());
        self.dead.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Tell every listener the stream is gone and drop the entry.
    pub fn close_stream(&self, stream_id: &str, reason: &str) -> usize {
        self.forget(stream_id);
        let Some(listeners) = self.streams.write().remove(stream_id) else {
            return 0;
        };
        for listener in &listeners {
            let _ = listener.send(HubFrame::Closed { reason: reason.to_string() });
        }
        info!("[hub] Closed {} ({} listeners, {})", stream_id, listeners.len(), reason);
        listeners.len()
    }

    // ── Inactivity ─────────────────────────────────────────────────────

    /// Mark traffic on a stream. Also starts tracking a new stream.
    pub fn touch(&self, stream_id: &str) {
        self.touch_at(stream_id, Instant::now());
    }

    pub fn touch_at(&self, stream_id: &str, at: Instant) {
        self.activity.write().insert(stream_id.to_string(), at);
    }

    /// Streams with no traffic for at least `window`.
    pub fn idle_streams(&self, now: Instant, window: Duration) -> Vec<String> {
        let mut idle: Vec<String> = self
            .activity
            .read()
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= window)
            .map(|(stream, _)| stream.clone())
            .collect();
        idle.sort();
        idle
    }

    pub fn forget(&self, stream_id: &str) {
        self.activity.write().remove(stream_id);
    }

    // ── Observers ──────────────────────────────────────────────────────

    pub fn observe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.metrics.subscribe()
    }

    /// Returns the number of observers reached.
    pub fn publish_metrics(&self, snapshot: MetricsSnapshot) -> usize {
        self.metrics.send(snapshot).unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        let streams = self.streams.read();
        HubStats {
            streams: streams.len(),
            listeners: streams.values().map(Vec::len).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dead_listeners: self.dead.load(Ordering::Relaxed),
            observers: self.metrics.receiver_count(),
        }
    }
}
