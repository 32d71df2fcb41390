// ── Chorus Atoms: Canonical Types ──────────────────────────────────────────
// The records that flow through the pipeline. Platform-shaped payloads are
// normalized once, at the edge, into a ChatDraft and then a CanonicalMessage.

use crate::atoms::constants::CHECKPOINT_KEY_PREFIX;
use crate::atoms::error::{EngineError, EngineResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Platform ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Kick,
    YouTube,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Twitch, Platform::Kick, Platform::YouTube];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Kick => "kick",
            Platform::YouTube => "youtube",
        }
    }

    /// Poll-based upstreams are driven by the lifecycle manager's cadence.
    pub fn is_poll_based(&self) -> bool {
        matches!(self, Platform::YouTube)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "twitch" => Ok(Platform::Twitch),
            "kick" => Ok(Platform::Kick),
            "youtube" | "yt" => Ok(Platform::YouTube),
            other => Err(EngineError::Config(format!("unknown platform '{}'", other))),
        }
    }
}

// ── Channel key ────────────────────────────────────────────────────────────

/// (platform, channel) — the identity of one upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub platform: Platform,
    pub channel: String,
}

impl ChannelKey {
    /// Normalize a user-supplied channel name. Twitch and Kick names are
    /// case-insensitive; YouTube video ids are not.
    pub fn new(platform: Platform, channel: &str) -> EngineResult<Self> {
        let trimmed = channel.trim().trim_start_matches(['#', '@']);
        if trimmed.is_empty() {
            return Err(EngineError::Config("channel name is empty".into()));
        }
        let channel = match platform {
            Platform::YouTube => trimmed.to_string(),
            Platform::Twitch | Platform::Kick => trimmed.to_lowercase(),
        };
        Ok(ChannelKey { platform, channel })
    }

    /// Parse `platform:channel` as accepted on the command line.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let (platform, channel) = input
            .split_once(':')
            .ok_or_else(|| EngineError::Config(format!("expected platform:channel, got '{}'", input)))?;
        ChannelKey::new(platform.parse()?, channel)
    }

    /// Streams are addressed as `{platform}-{channel}`.
    pub fn stream_id(&self) -> String {
        format!("{}-{}", self.platform, self.channel)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.channel)
    }
}

/// Connection ids are `{platform}-{channel}-{unix_millis}`.
pub fn new_connection_id(key: &ChannelKey, at: DateTime<Utc>) -> String {
    format!("{}-{}", key.stream_id(), at.timestamp_millis())
}

/// The stream a connection id belongs to (its id minus the timestamp).
pub fn stream_id_of(connection_id: &str) -> Option<&str> {
    let (stream, millis) = connection_id.rsplit_once('-')?;
    millis.chars().all(|c| c.is_ascii_digit()).then_some(stream)
}

// ── Moderation verdicts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Spam,
    LowQuality,
    Quality,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Spam => "spam",
            Classification::LowQuality => "low-quality",
            Classification::Quality => "quality",
        }
    }
}

impl FromStr for Classification {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spam" => Ok(Classification::Spam),
            "low-quality" => Ok(Classification::LowQuality),
            "quality" => Ok(Classification::Quality),
            other => Err(EngineError::Other(format!("unknown classification '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Neutral,
    Sad,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Neutral => "neutral",
            Mood::Sad => "sad",
        }
    }
}

impl FromStr for Mood {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "happy" => Ok(Mood::Happy),
            "neutral" => Ok(Mood::Neutral),
            "sad" => Ok(Mood::Sad),
            other => Err(EngineError::Other(format!("unknown mood '{}'", other))),
        }
    }
}

// ── Canonical message ──────────────────────────────────────────────────────

/// Platform-agnostic chat message. Built once by the pipeline, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub id: String,
    pub stream_id: String,
    pub platform: Platform,
    pub identity: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_question: bool,
    pub is_spam: bool,
    pub score: f64,
    pub classification: Classification,
    pub sentiment: Mood,
}

/// A normalized upstream event before moderation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatDraft {
    pub id: String,
    pub identity: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

// ── Raw platform events ────────────────────────────────────────────────────

/// Twitch IRC PRIVMSG with the tags we care about.
#[derive(Debug, Clone, PartialEq)]
pub struct TwitchPrivmsg {
    /// `id` tag.
    pub id: Option<String>,
    /// IRC nick from the prefix.
    pub login: String,
    /// `display-name` tag.
    pub display_name: Option<String>,
    pub text: String,
    /// `tmi-sent-ts` tag (unix millis).
    pub sent_ts_ms: Option<i64>,
}

/// Kick `ChatMessageEvent` payload from the Pusher channel.
#[derive(Debug, Clone, PartialEq)]
pub struct KickChatEvent {
    pub id: String,
    pub username: String,
    pub content: String,
    /// RFC 3339.
    pub created_at: Option<String>,
}

/// One `liveChatMessages` item from the YouTube Data API.
#[derive(Debug, Clone, PartialEq)]
pub struct YouTubeChatItem {
    pub id: String,
    pub author_name: String,
    pub message: String,
    /// RFC 3339.
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Twitch(TwitchPrivmsg),
    Kick(KickChatEvent),
    YouTube(YouTubeChatItem),
}

impl RawEvent {
    /// The platform's own message id, when it sent one.
    pub fn upstream_id(&self) -> Option<&str> {
        let id = match self {
            RawEvent::Twitch(e) => e.id.as_deref()?,
            RawEvent::Kick(e) => e.id.as_str(),
            RawEvent::YouTube(e) => e.id.as_str(),
        };
        (!id.is_empty()).then_some(id)
    }
}

/// Adapter contract: one platform payload → one draft.
/// `None` means the event carries no usable sender.
pub trait Normalize {
    fn platform(&self) -> Platform;
    fn normalize(&self) -> Option<ChatDraft>;
}

fn parse_rfc3339(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn id_or_fresh(id: Option<&str>) -> String {
    match id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

impl Normalize for TwitchPrivmsg {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    fn normalize(&self) -> Option<ChatDraft> {
        let identity = self
            .display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.login)
            .trim()
            .to_string();
        if identity.is_empty() {
            return None;
        }
        let timestamp = self
            .sent_ts_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Some(ChatDraft {
            id: id_or_fresh(self.id.as_deref()),
            identity,
            text: self.text.clone(),
            timestamp,
        })
    }
}

impl Normalize for KickChatEvent {
    fn platform(&self) -> Platform {
        Platform::Kick
    }

    fn normalize(&self) -> Option<ChatDraft> {
        let identity = self.username.trim();
        if identity.is_empty() {
            return None;
        }
        Some(ChatDraft {
            id: id_or_fresh(Some(&self.id)),
            identity: identity.to_string(),
            text: self.content.clone(),
            timestamp: parse_rfc3339(self.created_at.as_deref()),
        })
    }
}

impl Normalize for YouTubeChatItem {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    fn normalize(&self) -> Option<ChatDraft> {
        let identity = self.author_name.trim();
        if identity.is_empty() {
            return None;
        }
        Some(ChatDraft {
            id: id_or_fresh(Some(&self.id)),
            identity: identity.to_string(),
            text: self.message.clone(),
            timestamp: parse_rfc3339(self.published_at.as_deref()),
        })
    }
}

impl Normalize for RawEvent {
    fn platform(&self) -> Platform {
        match self {
            RawEvent::Twitch(e) => e.platform(),
            RawEvent::Kick(e) => e.platform(),
            RawEvent::YouTube(e) => e.platform(),
        }
    }

    fn normalize(&self) -> Option<ChatDraft> {
        match self {
            RawEvent::Twitch(e) => e.normalize(),
            RawEvent::Kick(e) => e.normalize(),
            RawEvent::YouTube(e) => e.normalize(),
        }
    }
}

// ── Connection lifecycle ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Live,
    Retrying,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    Explicit,
    Quota,
    MaxRetries,
    Shutdown,
    Inactive,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Explicit => "explicit",
            DisconnectReason::Quota => "quota",
            DisconnectReason::MaxRetries => "max-retries",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Inactive => "inactive",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific resume state carried inside a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCursor {
    /// Upstream id resolved from the channel name (Kick chatroom id,
    /// YouTube liveChatId). Saves a lookup on resume.
    pub resolved_id: Option<String>,
    /// Poll cursor (YouTube `nextPageToken`).
    pub page_token: Option<String>,
    /// Last adapted poll interval.
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub connection_id: String,
    pub platform: Platform,
    pub channel: String,
    pub cursor: SessionCursor,
    /// Newest message id already handed to the pipeline.
    pub last_message_id: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn store_key(connection_id: &str) -> String {
        format!("{}{}", CHECKPOINT_KEY_PREFIX, connection_id)
    }

    pub fn channel_key(&self) -> EngineResult<ChannelKey> {
        ChannelKey::new(self.platform, &self.channel)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.saved_at).num_seconds()
    }
}

// ── Persistence units ──────────────────────────────────────────────────────

/// One flushed batch: the unit of work carried by the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushUnit {
    pub unit_id: String,
    pub stream_id: String,
    pub messages: Vec<CanonicalMessage>,
    pub created_at: DateTime<Utc>,
}

impl FlushUnit {
    pub fn new(stream_id: impl Into<String>, messages: Vec<CanonicalMessage>) -> Self {
        FlushUnit {
            unit_id: format!("batch-{}", uuid::Uuid::new_v4()),
            stream_id: stream_id.into(),
            messages,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one idempotent batch write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    pub inserted: Vec<String>,
    pub duplicates: usize,
    pub evicted: usize,
}
