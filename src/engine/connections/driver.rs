// Per-connection driver task.
// Opens the upstream session, forwards deliveries, paces poll-based
// upstreams, checkpoints periodically and retries failures with backoff
// until the retry budget runs out.

use super::quota::QuotaTracker;
use super::{ConnectionEntry, ConnectionEvent, Shared};
use chorus_core::atoms::traits::{Delivery, PlatformSession};
use chorus_core::{Checkpoint, ConnectionState, DisconnectReason, EngineError, RawEvent, SessionCursor};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Why a live session stopped.
enum SessionEnd {
    Cancelled,
    Failed(EngineError),
}

/// Resolves once the connection has been cancelled (or its manager dropped).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Drops events a resumed connection already forwarded before the restart.
/// Armed with the checkpoint's last message id; disarms after the first
/// non-empty delivery.
pub(crate) struct ReplayGuard {
    last_seen: Option<String>,
}

impl ReplayGuard {
    pub(crate) fn new(last_seen: Option<String>) -> Self {
        ReplayGuard { last_seen }
    }

    pub(crate) fn filter(&mut self, events: Vec<RawEvent>) -> Vec<RawEvent> {
        if events.is_empty() {
            return events;
        }
        let Some(last) = self.last_seen.take() else {
            return events;
        };
        match events.iter().position(|e| e.upstream_id() == Some(last.as_str())) {
            Some(i) => {
                debug!("[conn] Skipping {} already-seen events after resume", i + 1);
                events.into_iter().skip(i + 1).collect()
            }
            None => events,
        }
    }
}

pub(super) struct Driver {
    shared: Arc<Shared>,
    entry: Arc<ConnectionEntry>,
    cancel: watch::Receiver<bool>,
    resume: Option<Checkpoint>,
}

impl Driver {
    pub(super) fn new(
        shared: Arc<Shared>,
        entry: Arc<ConnectionEntry>,
        cancel: watch::Receiver<bool>,
        resume: Option<Checkpoint>,
    ) -> Self {
        Driver { shared, entry, cancel, resume }
    }

    fn id(&self) -> &str {
        &self.entry.handle.connection_id
    }

    pub(super) async fn run(mut self) {
        let key = self.entry.handle.key.clone();
        let Some(connector) = self.shared.connectors.get(key.platform) else {
            warn!("[conn] No connector for {}", key.platform);
            self.shared.finish(self.id(), DisconnectReason::Explicit).await;
            return;
        };

        let resume = self.resume.take();
        let mut announced = resume.is_some();
        let mut guard = ReplayGuard::new(resume.as_ref().and_then(|cp| cp.last_message_id.clone()));
        let mut quota =
            QuotaTracker::new(self.shared.settings.quota_daily_ceiling, self.shared.settings.quota_warn_ratio);

        loop {
            self.change_state(ConnectionState::Connecting).await;
            let cursor = self.entry.status.lock().cursor.clone();
            let resume_cursor = (cursor != SessionCursor::default()).then_some(cursor);

            let opened = tokio::select! {
                _ = cancelled(&mut self.cancel) => return,
                opened = connector.open(&key, resume_cursor.as_ref()) => opened,
            };

            let failure = match opened {
                Ok(mut session) => {
                    self.entry.mark_live();
                    self.emit(ConnectionEvent::StateChanged {
                        connection_id: self.id().to_string(),
                        state: ConnectionState::Live,
                    })
                    .await;
                    if !announced {
                        announced = true;
                        info!("[conn] {} live", self.id());
                        self.emit(ConnectionEvent::Connected {
                            connection_id: self.id().to_string(),
                            key: key.clone(),
                        })
                        .await;
                    }
                    self.save_checkpoint(session.cursor()).await;

                    let end = self.drive(session.as_mut(), &mut guard, &mut quota).await;
                    session.close().await;
                    match end {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if matches!(failure, EngineError::QuotaExceeded { .. }) {
                warn!("[conn] {} out of provider quota: {}", self.id(), failure);
                self.shared.finish(self.id(), DisconnectReason::Quota).await;
                return;
            }

            let attempt = self.entry.record_failure(&failure);
            if attempt >= self.shared.settings.max_retries {
                warn!("[conn] {} failed {} times in a row, giving up: {}", self.id(), attempt, failure);
                self.shared.finish(self.id(), DisconnectReason::MaxRetries).await;
                return;
            }

            let delay = self.shared.settings.backoff(attempt);
            warn!(
                "[conn] {} failed (attempt {}/{}), retrying in {:?}: {}",
                self.id(),
                attempt,
                self.shared.settings.max_retries,
                delay,
                failure
            );
            self.change_state(ConnectionState::Retrying).await;
            self.emit(ConnectionEvent::Retrying {
                connection_id: self.id().to_string(),
                attempt,
                delay,
                error: failure.to_string(),
            })
            .await;

            tokio::select! {
                _ = cancelled(&mut self.cancel) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Read deliveries until the session fails or the connection is cancelled.
    async fn drive(
        &mut self,
        session: &mut dyn PlatformSession,
        guard: &mut ReplayGuard,
        quota: &mut QuotaTracker,
    ) -> SessionEnd {
        let mut checkpoints = tokio::time::interval(self.shared.settings.checkpoint_interval());
        checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);
        checkpoints.tick().await;

        loop {
            let delivery = tokio::select! {
                _ = cancelled(&mut self.cancel) => return SessionEnd::Cancelled,
                _ = checkpoints.tick() => {
                    self.save_checkpoint(session.cursor()).await;
                    continue;
                }
                delivery = session.next_delivery() => delivery,
            };

            let (events, pause) = match delivery {
                Ok(Delivery::Idle) => {
                    self.entry.status.lock().last_activity = chrono::Utc::now();
                    continue;
                }
                Ok(Delivery::Push(events)) => (events, None),
                Ok(Delivery::Poll { events, interval_hint, api_calls }) => {
                    let interval = self.shared.settings.poll_interval(interval_hint);
                    if let Some(usage) = quota.record(api_calls) {
                        warn!(
                            "[conn] {} projected {} provider calls/day against a ceiling of {}",
                            self.id(),
                            usage.projected_daily,
                            usage.ceiling
                        );
                        self.emit(ConnectionEvent::QuotaWarning { connection_id: self.id().to_string(), usage })
                            .await;
                    }
                    self.entry.record_poll(interval, quota.usage());
                    (events, Some(interval))
                }
                Err(e) => return SessionEnd::Failed(e),
            };

            let events = guard.filter(events);
            let last_id = events.iter().rev().find_map(|e| e.upstream_id()).map(str::to_string);
            self.entry.record_messages(events.len(), last_id, session.cursor());

            if !events.is_empty() {
                let event = ConnectionEvent::Messages {
                    connection_id: self.id().to_string(),
                    key: self.entry.handle.key.clone(),
                    events,
                };
                let sent = tokio::select! {
                    _ = cancelled(&mut self.cancel) => return SessionEnd::Cancelled,
                    sent = self.shared.events.send(event) => sent,
                };
                if sent.is_err() {
                    return SessionEnd::Cancelled;
                }
            }

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancelled(&mut self.cancel) => return SessionEnd::Cancelled,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    async fn save_checkpoint(&self, cursor: SessionCursor) {
        self.entry.status.lock().cursor = cursor;
        let checkpoint = self.entry.checkpoint();
        if let Err(e) = self.shared.checkpoints.save(&checkpoint, self.shared.settings.checkpoint_ttl()).await {
            warn!("[conn] Checkpoint for {} failed: {}", self.id(), e);
        }
    }

    async fn change_state(&self, state: ConnectionState) {
        self.entry.set_state(state);
        self.emit(ConnectionEvent::StateChanged { connection_id: self.id().to_string(), state }).await;
    }

    /// Lifecycle notices. Best effort: a full channel never stalls the driver
    /// past a cancellation.
    async fn emit(&self, event: ConnectionEvent) {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = cancelled(&mut cancel) => {}
            _ = self.shared.events.send(event) => {}
        }
    }
}
