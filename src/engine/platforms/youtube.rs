// Chorus Platforms — YouTube
//
// Poll-based. The video id is resolved to its activeLiveChatId through the
// Data API `videos` endpoint, then `liveChat/messages` is polled with the
// returned pageToken. Every response carries pollingIntervalMillis, handed
// to the connection manager as the next interval hint.
//
// API keys rotate: a key answering quotaExceeded is parked for an hour and
// the next one is tried. When every key is parked the session fails with
// QuotaExceeded and the connection ends with reason `quota`.

use super::preview;
use crate::config::YouTubeSettings;
use async_trait::async_trait;
use chorus_core::atoms::constants::QUOTA_KEY_RESET_SECS;
use chorus_core::atoms::traits::{Delivery, PlatformConnector, PlatformSession};
use chorus_core::{ChannelKey, EngineError, EngineResult, Platform, RawEvent, SessionCursor, YouTubeChatItem};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const QUOTA_REASONS: [&str; 3] = ["quotaExceeded", "dailyLimitExceeded", "rateLimitExceeded"];

fn conn_err(e: impl ToString) -> EngineError {
    EngineError::connection("youtube", e.to_string())
}

// ── API key ring ───────────────────────────────────────────────────────

struct KeyState {
    key: String,
    calls: u64,
    exhausted_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyUsage {
    /// First characters only.
    pub key: String,
    pub calls: u64,
    pub exhausted: bool,
}

pub struct ApiKeyRing {
    keys: Vec<KeyState>,
    current: usize,
    reset_after: Duration,
}

impl ApiKeyRing {
    pub fn new(keys: Vec<String>) -> Self {
        ApiKeyRing {
            keys: keys.into_iter().map(|key| KeyState { key, calls: 0, exhausted_at: None }).collect(),
            current: 0,
            reset_after: Duration::from_secs(QUOTA_KEY_RESET_SECS),
        }
    }

    /// The active key, skipping parked ones. `None` when all are parked.
    pub fn current(&mut self) -> Option<String> {
        let n = self.keys.len();
        for step in 0..n {
            let idx = (self.current + step) % n;
            if self.keys[idx].exhausted_at.is_none() {
                self.current = idx;
                return Some(self.keys[idx].key.clone());
            }
        }
        None
    }

    pub fn record_call(&mut self, key: &str) {
        if let Some(k) = self.keys.iter_mut().find(|k| k.key == key) {
            k.calls += 1;
        }
    }

    pub fn mark_exhausted(&mut self, key: &str) {
        self.mark_exhausted_at(key, Instant::now());
    }

    fn mark_exhausted_at(&mut self, key: &str, now: Instant) {
        if let Some(k) = self.keys.iter_mut().find(|k| k.key == key) {
            k.exhausted_at = Some(now);
            warn!("[youtube] API key {}... out of quota", key_prefix(key));
        }
    }

    /// Un-park keys whose quota window has passed.
    pub fn reset_expired(&mut self, now: Instant) -> usize {
        let mut reset = 0;
        for k in &mut self.keys {
            if k.exhausted_at.is_some_and(|at| now.saturating_duration_since(at) >= self.reset_after) {
                k.exhausted_at = None;
                k.calls = 0;
                reset += 1;
            }
        }
        if reset > 0 {
            info!("[youtube] Reset quota status for {} API keys", reset);
        }
        reset
    }

    pub fn available(&self) -> usize {
        self.keys.iter().filter(|k| k.exhausted_at.is_none()).count()
    }

    pub fn usage(&self) -> Vec<KeyUsage> {
        self.keys
            .iter()
            .map(|k| KeyUsage { key: key_prefix(&k.key), calls: k.calls, exhausted: k.exhausted_at.is_some() })
            .collect()
    }
}

fn key_prefix(key: &str) -> String {
    key.chars().take(10).collect()
}

// ── HTTP ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Api {
    http: reqwest::Client,
    base: String,
    keys: Arc<Mutex<ApiKeyRing>>,
}

impl Api {
    /// GET `{base}/{path}` with the active key, rotating keys on quota errors.
    /// `calls` counts every request actually sent.
    async fn get(&self, path: &str, query: &[(&str, &str)], calls: &mut u32) -> EngineResult<Value> {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), path);
        loop {
            let Some(key) = self.keys.lock().current() else {
                return Err(EngineError::quota_exceeded("youtube"));
            };
            let resp = self.http.get(&url).query(query).query(&[("key", key.as_str())]).send().await;
            *calls += 1;
            self.keys.lock().record_call(&key);
            let resp = resp.map_err(conn_err)?;

            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if status.is_success() {
                return Ok(body);
            }
            match error_reason(&body) {
                Some(reason) if QUOTA_REASONS.contains(&reason.as_str()) => {
                    self.keys.lock().mark_exhausted(&key);
                    continue;
                }
                reason => {
                    return Err(conn_err(format!(
                        "{} returned {} ({})",
                        path,
                        status,
                        reason.unwrap_or_else(|| "no reason".into())
                    )))
                }
            }
        }
    }
}

// ── Connector ──────────────────────────────────────────────────────────

pub struct YouTubeConnector {
    api: Api,
}

impl YouTubeConnector {
    pub fn new(settings: YouTubeSettings, http: reqwest::Client) -> Self {
        let keys = Arc::new(Mutex::new(ApiKeyRing::new(settings.api_keys)));
        YouTubeConnector { api: Api { http, base: settings.api_base, keys } }
    }

    pub fn key_usage(&self) -> Vec<KeyUsage> {
        self.api.keys.lock().usage()
    }
}

#[async_trait]
impl PlatformConnector for YouTubeConnector {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn open(&self, key: &ChannelKey, resume: Option<&SessionCursor>) -> EngineResult<Box<dyn PlatformSession>> {
        let mut calls = 0;
        let (live_chat_id, page_token) = match resume.and_then(|c| c.resolved_id.clone()) {
            Some(id) => (id, resume.and_then(|c| c.page_token.clone())),
            None => {
                let body = self
                    .api
                    .get("videos", &[("part", "snippet,liveStreamingDetails"), ("id", key.channel.as_str())], &mut calls)
                    .await?;
                (live_chat_from_video(&body)?, None)
            }
        };
        info!("[youtube] Polling {} (liveChatId {})", key.channel, live_chat_id);

        Ok(Box::new(YouTubeSession {
            api: self.api.clone(),
            video_id: key.channel.clone(),
            live_chat_id,
            page_token,
            interval_ms: resume.and_then(|c| c.poll_interval_ms),
            pending_calls: calls,
        }))
    }

    fn maintain(&self) {
        self.api.keys.lock().reset_expired(Instant::now());
    }
}

// ── Session ────────────────────────────────────────────────────────────

struct YouTubeSession {
    api: Api,
    video_id: String,
    live_chat_id: String,
    page_token: Option<String>,
    interval_ms: Option<u64>,
    /// Calls made while opening, reported with the first poll.
    pending_calls: u32,
}

#[async_trait]
impl PlatformSession for YouTubeSession {
    async fn next_delivery(&mut self) -> EngineResult<Delivery> {
        let mut calls = std::mem::take(&mut self.pending_calls);
        let mut query = vec![("liveChatId", self.live_chat_id.as_str()), ("part", "snippet,authorDetails")];
        if let Some(token) = self.page_token.as_deref() {
            query.push(("pageToken", token));
        }
        let result = self.api.get("liveChat/messages", &query, &mut calls).await;
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                // Keep the already-spent calls counted on the next attempt
                self.pending_calls = calls;
                return Err(e);
            }
        };

        let page = parse_chat_page(&body);
        if let Some(token) = page.next_page_token {
            self.page_token = Some(token);
        }
        if page.interval_ms.is_some() {
            self.interval_ms = page.interval_ms;
        }
        for item in &page.items {
            debug!("[youtube] {} in {}: {}", item.author_name, self.video_id, preview(&item.message));
        }

        Ok(Delivery::Poll {
            events: page.items.into_iter().map(RawEvent::YouTube).collect(),
            interval_hint: page.interval_ms.map(Duration::from_millis),
            api_calls: calls,
        })
    }

    fn cursor(&self) -> SessionCursor {
        SessionCursor {
            resolved_id: Some(self.live_chat_id.clone()),
            page_token: self.page_token.clone(),
            poll_interval_ms: self.interval_ms,
        }
    }

    async fn close(&mut self) {
        debug!("[youtube] Stopped polling {}", self.video_id);
    }
}

// ── Response parsing ───────────────────────────────────────────────────

fn error_reason(body: &Value) -> Option<String> {
    body.pointer("/error/errors/0/reason").and_then(Value::as_str).map(String::from)
}

/// `videos.list` → activeLiveChatId of a video that is live right now.
fn live_chat_from_video(body: &Value) -> EngineResult<String> {
    let video = body
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .ok_or_else(|| conn_err("video not found"))?;
    let live = video.pointer("/snippet/liveBroadcastContent").and_then(Value::as_str) == Some("live");
    if !live {
        return Err(conn_err("video is not live"));
    }
    video
        .pointer("/liveStreamingDetails/activeLiveChatId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| conn_err("no active live chat"))
}

struct ChatPage {
    items: Vec<YouTubeChatItem>,
    next_page_token: Option<String>,
    interval_ms: Option<u64>,
}

fn parse_chat_page(body: &Value) -> ChatPage {
    let items = body
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(chat_item).collect())
        .unwrap_or_default();
    ChatPage {
        items,
        next_page_token: body.get("nextPageToken").and_then(Value::as_str).map(String::from),
        interval_ms: body.get("pollingIntervalMillis").and_then(Value::as_u64),
    }
}

fn chat_item(item: &Value) -> Option<YouTubeChatItem> {
    let message = item
        .pointer("/snippet/displayMessage")
        .or_else(|| item.pointer("/snippet/textMessageDetails/messageText"))
        .and_then(Value::as_str)?;
    Some(YouTubeChatItem {
        id: item.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        author_name: item.pointer("/authorDetails/displayName").and_then(Value::as_str).unwrap_or_default().to_string(),
        message: message.to_string(),
        published_at: item.pointer("/snippet/publishedAt").and_then(Value::as_str).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ring_rotates_and_resets() {
        let mut ring = ApiKeyRing::new(vec!["key-aaaaaaaaaaaa".into(), "key-bbbbbbbbbbbb".into()]);
        let t0 = Instant::now();
        assert_eq!(ring.current().as_deref(), Some("key-aaaaaaaaaaaa"));
        ring.record_call("key-aaaaaaaaaaaa");
        ring.mark_exhausted_at("key-aaaaaaaaaaaa", t0);
        assert_eq!(ring.current().as_deref(), Some("key-bbbbbbbbbbbb"));
        ring.mark_exhausted_at("key-bbbbbbbbbbbb", t0);
        assert_eq!(ring.current(), None);
        assert_eq!(ring.available(), 0);

        assert_eq!(ring.reset_expired(t0 + Duration::from_secs(60)), 0);
        assert_eq!(ring.reset_expired(t0 + Duration::from_secs(QUOTA_KEY_RESET_SECS)), 2);
        assert_eq!(ring.available(), 2);
        let usage = ring.usage();
        assert_eq!(usage[0].key, "key-aaaaaa");
        assert_eq!(usage[0].calls, 0);
    }

    #[test]
    fn test_live_chat_from_video() {
        let body = json!({ "items": [{
            "snippet": { "title": "stream", "liveBroadcastContent": "live" },
            "liveStreamingDetails": { "activeLiveChatId": "Cg0KC2xpdmUtY2hhdA" }
        }]});
        assert_eq!(live_chat_from_video(&body).unwrap(), "Cg0KC2xpdmUtY2hhdA");

        let ended = json!({ "items": [{ "snippet": { "liveBroadcastContent": "none" } }] });
        assert!(live_chat_from_video(&ended).is_err());
        assert!(live_chat_from_video(&json!({ "items": [] })).is_err());
    }

    #[test]
    fn test_parse_chat_page() {
        let body = json!({
            "nextPageToken": "GO8BCg",
            "pollingIntervalMillis": 5077,
            "items": [
                {
                    "id": "LCC.abc",
                    "snippet": { "displayMessage": "hello from youtube", "publishedAt": "2024-05-01T18:22:03.1+00:00" },
                    "authorDetails": { "displayName": "Viewer One" }
                },
                { "id": "LCC.deleted", "snippet": { "type": "messageDeletedEvent" } }
            ]
        });
        let page = parse_chat_page(&body);
        assert_eq!(page.next_page_token.as_deref(), Some("GO8BCg"));
        assert_eq!(page.interval_ms, Some(5077));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].author_name, "Viewer One");
        assert_eq!(page.items[0].message, "hello from youtube");
    }

    #[test]
    fn test_error_reason() {
        let body = json!({ "error": { "code": 403, "errors": [{ "reason": "quotaExceeded", "domain": "youtube.quota" }] } });
        assert_eq!(error_reason(&body).as_deref(), Some("quotaExceeded"));
        assert_eq!(error_reason(&json!({})), None);
    }
}
