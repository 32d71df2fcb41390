// Chorus Engine — Platform Sessions
//
// One PlatformConnector per upstream. Connectors open sessions; sessions
// turn protocol traffic into RawEvents and report resume state. Retry
// policy belongs to the connection manager, never to a session.
//
//   twitch  — anonymous IRC over WebSocket (push)
//   kick    — channel lookup + Pusher WebSocket (push)
//   youtube — Data API liveChatMessages polling with key rotation (poll)

pub mod kick;
pub mod twitch;
pub mod youtube;

use crate::config::PlatformSettings;
use chorus_core::atoms::traits::PlatformConnector;
use chorus_core::{EngineError, EngineResult, Platform};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Connectors by platform.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    connectors: HashMap<Platform, Arc<dyn PlatformConnector>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connector for its platform.
    pub fn register(&mut self, connector: Arc<dyn PlatformConnector>) {
        self.connectors.insert(connector.platform(), connector);
    }

    pub fn with(mut self, connector: Arc<dyn PlatformConnector>) -> Self {
        self.register(connector);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformConnector>> {
        self.connectors.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL.into_iter().filter(|p| self.connectors.contains_key(p)).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn PlatformConnector>> {
        self.connectors.values()
    }

    /// The production connectors enabled in `settings`.
    pub fn from_settings(settings: &PlatformSettings) -> EngineResult<Self> {
        let http = http_client()?;
        let mut registry = PlatformRegistry::new();
        if settings.twitch.enabled {
            registry.register(Arc::new(twitch::TwitchConnector::new(settings.twitch.clone())));
        }
        if settings.kick.enabled {
            registry.register(Arc::new(kick::KickConnector::new(settings.kick.clone(), http.clone())));
        }
        if settings.youtube.enabled {
            if settings.youtube.api_keys.is_empty() {
                info!("[platforms] YouTube enabled but no API keys configured, skipping");
            } else {
                registry.register(Arc::new(youtube::YouTubeConnector::new(settings.youtube.clone(), http)));
            }
        }
        info!("[platforms] Enabled: {:?}", registry.platforms());
        Ok(registry)
    }
}

/// Shared HTTP client for platform lookups and polling.
fn http_client() -> EngineResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("chorus/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| EngineError::Config(format!("http client: {}", e)))
}

/// Shorten chat text for debug logs.
pub(crate) fn preview(text: &str) -> String {
    const LIMIT: usize = 50;
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
