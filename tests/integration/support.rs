// Test doubles and harness shared by the integration suites.

use async_trait::async_trait;
use chorus::config::ChorusConfig;
use chorus::engine::orchestrator::{Engine, EngineDeps};
use chorus::engine::platforms::PlatformRegistry;
use chorus_core::atoms::traits::{Delivery, PlatformConnector, PlatformSession};
use chorus_core::store::{MemoryCheckpointStore, MemoryWorkQueue, MessageStore, RetentionPolicy, StorePool};
use chorus_core::{ChannelKey, EngineError, EngineResult, KickChatEvent, Platform, RawEvent, SessionCursor, TwitchPrivmsg};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scores as quality for any sender, and reads as a question.
pub const GOOD: &str = "what do you think about the new patch for this game";

pub type Feed = mpsc::UnboundedSender<EngineResult<Delivery>>;

// ── Scripted connector ─────────────────────────────────────────────────────

enum Step {
    Fail,
    QuotaExceeded,
    Live(mpsc::UnboundedReceiver<EngineResult<Delivery>>),
}

#[derive(Clone, Copy)]
pub enum WhenEmpty {
    /// Open an idle session that never delivers.
    Idle,
    /// Fail every open.
    Fail,
}

pub struct ScriptedConnector {
    platform: Platform,
    steps: Mutex<VecDeque<Step>>,
    when_empty: WhenEmpty,
    opens: AtomicUsize,
    resumes: Mutex<Vec<Option<SessionCursor>>>,
}

impl ScriptedConnector {
    pub fn new(platform: Platform, when_empty: WhenEmpty) -> Arc<Self> {
        Arc::new(ScriptedConnector {
            platform,
            steps: Mutex::new(VecDeque::new()),
            when_empty,
            opens: AtomicUsize::new(0),
            resumes: Mutex::new(Vec::new()),
        })
    }

    /// The next open succeeds; deliveries sent on the returned feed come out
    /// of that session in order.
    pub fn push_live(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.steps.lock().push_back(Step::Live(rx));
        tx
    }

    pub fn push_failure(&self) {
        self.steps.lock().push_back(Step::Fail);
    }

    pub fn push_quota_exceeded(&self) {
        self.steps.lock().push_back(Step::QuotaExceeded);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> Vec<Option<SessionCursor>> {
        self.resumes.lock().clone()
    }
}

#[async_trait]
impl PlatformConnector for ScriptedConnector {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn open(&self, key: &ChannelKey, resume: Option<&SessionCursor>) -> EngineResult<Box<dyn PlatformSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.resumes.lock().push(resume.cloned());
        let step = self.steps.lock().pop_front();
        let rx = match step {
            Some(Step::Live(rx)) => Some(rx),
            Some(Step::Fail) => return Err(EngineError::connection(key.platform.to_string(), "scripted failure")),
            Some(Step::QuotaExceeded) => return Err(EngineError::quota_exceeded(key.platform.to_string())),
            None => match self.when_empty {
                WhenEmpty::Idle => None,
                WhenEmpty::Fail => {
                    return Err(EngineError::connection(key.platform.to_string(), "upstream unreachable"))
                }
            },
        };
        Ok(Box::new(ScriptedSession { rx, resolved: resume.and_then(|c| c.resolved_id.clone()) }))
    }
}

struct ScriptedSession {
    rx: Option<mpsc::UnboundedReceiver<EngineResult<Delivery>>>,
    resolved: Option<String>,
}

#[async_trait]
impl PlatformSession for ScriptedSession {
    async fn next_delivery(&mut self) -> EngineResult<Delivery> {
        if let Some(rx) = self.rx.as_mut() {
            if let Some(delivery) = rx.recv().await {
                return delivery;
            }
            self.rx = None;
        }
        std::future::pending().await
    }

    fn cursor(&self) -> SessionCursor {
        SessionCursor { resolved_id: self.resolved.clone(), ..SessionCursor::default() }
    }

    async fn close(&mut self) {}
}

// ── Events ─────────────────────────────────────────────────────────────────

pub fn twitch(id: &str, login: &str, text: &str) -> RawEvent {
    RawEvent::Twitch(TwitchPrivmsg {
        id: Some(id.to_string()),
        login: login.to_string(),
        display_name: None,
        text: text.to_string(),
        sent_ts_ms: None,
    })
}

pub fn kick(id: &str, username: &str, text: &str) -> RawEvent {
    RawEvent::Kick(KickChatEvent {
        id: id.to_string(),
        username: username.to_string(),
        content: text.to_string(),
        created_at: None,
    })
}

// ── Harness ────────────────────────────────────────────────────────────────

/// Fast timers, small batches, nothing time-triggered unless a test asks.
pub fn test_config() -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.connection.base_delay_ms = 5;
    config.connection.max_delay_ms = 20;
    config.connection.max_retries = 3;
    config.batch.size = 10;
    config.batch.interval_ms = 60_000;
    config.persistence.workers = 2;
    config.persistence.queue_probe_secs = 1;
    config
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MessageStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub twitch: Arc<ScriptedConnector>,
    pub kick: Arc<ScriptedConnector>,
}

pub async fn harness(config: ChorusConfig) -> Harness {
    let pool = Arc::new(StorePool::open_in_memory().unwrap());
    let store = Arc::new(MessageStore::new(pool, RetentionPolicy::default()));
    let queue = Arc::new(MemoryWorkQueue::new("test-batches"));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let twitch = ScriptedConnector::new(Platform::Twitch, WhenEmpty::Idle);
    let kick = ScriptedConnector::new(Platform::Kick, WhenEmpty::Idle);

    let deps = EngineDeps {
        connectors: PlatformRegistry::new().with(twitch.clone()).with(kick.clone()),
        checkpoints: checkpoints.clone(),
        queue: queue.clone(),
        sink: store.clone(),
    };
    let engine = Engine::start(config, deps).await.unwrap();
    Harness { engine, store, queue, checkpoints, twitch, kick }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
