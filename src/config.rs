// Chorus — Configuration
//
// One TOML file, every field optional. Lookup order:
//   1. explicit path (CLI --config)
//   2. CHORUS_CONFIG environment variable
//   3. <config dir>/chorus/chorus.toml
//   4. built-in defaults
//
// YOUTUBE_API_KEYS (comma separated) overrides the configured key ring.

use chorus_core::atoms::constants::*;
use chorus_core::moderation::classifier::ClassifierSettings;
use chorus_core::moderation::scorer::ScoringSettings;
use chorus_core::store::RetentionPolicy;
use chorus_core::{EngineError, EngineResult};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "CHORUS_CONFIG";
const YOUTUBE_KEYS_ENV: &str = "YOUTUBE_API_KEYS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub connection: ConnectionSettings,
    pub classifier: ClassifierSettings,
    pub scoring: ScoringSettings,
    pub batch: BatchSettings,
    pub persistence: PersistenceSettings,
    pub hub: HubSettings,
    pub platforms: PlatformSettings,
}

// ── Connection lifecycle ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    /// Poll cadence when the server sends no hint.
    pub default_poll_ms: u64,
    /// Floor for server-hinted poll intervals.
    pub min_poll_ms: u64,
    pub checkpoint_interval_secs: u64,
    pub checkpoint_ttl_secs: u64,
    /// Checkpoints older than this are discarded on startup.
    pub checkpoint_freshness_secs: u64,
    /// Provider calls per day per API key.
    pub quota_daily_ceiling: u64,
    /// Warn once projected usage crosses this share of the ceiling.
    pub quota_warn_ratio: f64,
    /// Connection events buffered between drivers and the pipeline.
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            default_poll_ms: DEFAULT_POLL_MS,
            min_poll_ms: MIN_POLL_MS,
            checkpoint_interval_secs: 30,
            checkpoint_ttl_secs: DEFAULT_CHECKPOINT_TTL_SECS,
            checkpoint_freshness_secs: DEFAULT_CHECKPOINT_FRESHNESS_SECS,
            quota_daily_ceiling: DEFAULT_QUOTA_DAILY_CEILING,
            quota_warn_ratio: DEFAULT_QUOTA_WARN_RATIO,
            event_buffer: 4096,
        }
    }
}

impl ConnectionSettings {
    /// `min(max_delay, base · 2^retries)`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 2u64.saturating_pow(retries.min(32));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Next poll delay from an optional server hint, never below the floor.
    pub fn poll_interval(&self, hint: Option<Duration>) -> Duration {
        let wanted = hint.unwrap_or(Duration::from_millis(self.default_poll_ms));
        wanted.max(Duration::from_millis(self.min_poll_ms))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.max(1))
    }

    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }
}

// ── Batching & persistence ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub size: usize,
    pub interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings { size: DEFAULT_BATCH_SIZE, interval_ms: DEFAULT_BATCH_INTERVAL_MS }
    }
}

impl BatchSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// `work_queue` table in the chat database.
    Sqlite,
    /// In-process; lost on restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Database file. Defaults to `<data dir>/chorus/chorus.db`.
    pub path: Option<PathBuf>,
    pub pool_size: usize,
    pub pool_timeout_ms: u64,
    pub workers: usize,
    pub per_identity_cap: i64,
    pub per_stream_cap: i64,
    /// How often the inline fallback probes the queue backend.
    pub queue_probe_secs: u64,
    /// Longest wait on the queue backend before it counts as unreachable.
    pub queue_timeout_ms: u64,
    pub lease_secs: u64,
    pub queue: QueueBackend,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        PersistenceSettings {
            path: None,
            pool_size: DEFAULT_POOL_SIZE,
            pool_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            workers: 2,
            per_identity_cap: DEFAULT_PER_IDENTITY_CAP,
            per_stream_cap: DEFAULT_PER_STREAM_CAP,
            queue_probe_secs: 5,
            queue_timeout_ms: 2_000,
            lease_secs: DEFAULT_LEASE_SECS,
            queue: QueueBackend::Sqlite,
        }
    }
}

impl PersistenceSettings {
    pub fn database_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chorus")
                .join("chorus.db")
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy { per_identity_cap: self.per_identity_cap, per_stream_cap: self.per_stream_cap }
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn queue_probe(&self) -> Duration {
        Duration::from_secs(self.queue_probe_secs.max(1))
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms.max(1))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }
}

// ── Fan-out hub ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Frames buffered per listener before it counts as dead.
    pub listener_buffer: usize,
    pub heartbeat_secs: u64,
    /// Idle streams tear down their upstream after this long.
    pub inactivity_secs: u64,
    pub metrics_interval_secs: u64,
    /// Recently seen message ids remembered per stream.
    pub dedupe_window: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            listener_buffer: DEFAULT_LISTENER_BUFFER,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            inactivity_secs: DEFAULT_INACTIVITY_SECS,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }
}

impl HubSettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

// ── Platforms ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub twitch: TwitchSettings,
    pub kick: KickSettings,
    pub youtube: YouTubeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchSettings {
    pub enabled: bool,
    /// Anonymous read-only login.
    pub nick: String,
    pub url: String,
}

impl Default for TwitchSettings {
    fn default() -> Self {
        TwitchSettings {
            enabled: true,
            nick: "justinfan12345".into(),
            url: "wss://irc-ws.chat.twitch.tv:443".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KickSettings {
    pub enabled: bool,
    pub pusher_key: String,
    pub cluster: String,
    pub api_base: String,
}

impl Default for KickSettings {
    fn default() -> Self {
        KickSettings {
            enabled: true,
            pusher_key: "32cbd69e4b950bf97679".into(),
            cluster: "us2".into(),
            api_base: "https://kick.com".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeSettings {
    pub enabled: bool,
    /// Rotated when a key reports quota exhaustion.
    pub api_keys: Vec<String>,
    pub api_base: String,
}

impl Default for YouTubeSettings {
    fn default() -> Self {
        YouTubeSettings {
            enabled: true,
            api_keys: vec![],
            api_base: "https://www.googleapis.com/youtube/v3".into(),
        }
    }
}

// ── Loading ────────────────────────────────────────────────────────────────

/// `<config dir>/chorus/chorus.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chorus").join("chorus.toml"))
}

impl ChorusConfig {
    pub fn from_toml(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Resolve and load the effective configuration.
    pub fn load(explicit: Option<&Path>) -> EngineResult<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            info!("[config] Loading {}", path.display());
            Self::load_file(&path)?
        } else {
            match default_config_path().filter(|p| p.exists()) {
                Some(path) => {
                    info!("[config] Loading {}", path.display());
                    Self::load_file(&path)?
                }
                None => {
                    info!("[config] No config file found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(keys) = std::env::var(YOUTUBE_KEYS_ENV) {
            let keys: Vec<String> =
                keys.split(',').map(str::trim).filter(|k| !k.is_empty()).map(String::from).collect();
            if !keys.is_empty() {
                self.platforms.youtube.api_keys = keys;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = ChorusConfig::from_toml("").unwrap();
        assert_eq!(config, ChorusConfig::default());
        assert_eq!(config.batch.size, 50);
        assert_eq!(config.connection.max_retries, 10);
        assert_eq!(config.hub.inactivity_secs, 900);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = ChorusConfig::from_toml(
            r#"
            [batch]
            size = 10

            [persistence]
            queue = "memory"
            path = "/tmp/chat.db"

            [platforms.youtube]
            api_keys = ["k1", "k2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.batch.size, 10);
        assert_eq!(config.batch.interval_ms, 1000);
        assert_eq!(config.persistence.queue, QueueBackend::Memory);
        assert_eq!(config.persistence.database_path(), PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.persistence.workers, 2);
        assert_eq!(config.platforms.youtube.api_keys.len(), 2);
        assert!(config.platforms.kick.enabled);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = ChorusConfig::from_toml("[batch\nsize = 1").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_written_config_loads_back() {
        let mut config = ChorusConfig::default();
        config.hub.heartbeat_secs = 7;
        let raw = config.to_toml().unwrap();
        assert_eq!(ChorusConfig::from_toml(&raw).unwrap(), config);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let c = ConnectionSettings::default();
        assert_eq!(c.backoff(1), Duration::from_secs(10));
        assert_eq!(c.backoff(2), Duration::from_secs(20));
        assert_eq!(c.backoff(3), Duration::from_secs(40));
        assert_eq!(c.backoff(4), Duration::from_secs(60));
        assert_eq!(c.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_poll_interval_never_below_floor() {
        let c = ConnectionSettings::default();
        assert_eq!(c.poll_interval(None), Duration::from_secs(30));
        assert_eq!(c.poll_interval(Some(Duration::from_secs(2))), Duration::from_secs(15));
        assert_eq!(c.poll_interval(Some(Duration::from_secs(20))), Duration::from_secs(20));
    }
}
