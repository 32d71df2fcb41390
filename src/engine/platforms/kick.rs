// Chorus Platforms — Kick
//
// Two steps: resolve the channel slug to its chatroom id over HTTPS, then
// subscribe to `chatrooms.{id}.v2` on Kick's Pusher WebSocket. Chat frames
// arrive as `App\Events\ChatMessageEvent` with a JSON-encoded data string.
// The chatroom id is kept in the session cursor so a resume skips the lookup.

use super::preview;
use crate::config::KickSettings;
use async_trait::async_trait;
use chorus_core::atoms::traits::{Delivery, PlatformConnector, PlatformSession};
use chorus_core::{ChannelKey, EngineError, EngineResult, KickChatEvent, Platform, RawEvent, SessionCursor};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHAT_EVENT: &str = "App\\Events\\ChatMessageEvent";
/// Pusher drops clients silent for 120s.
const KEEPALIVE: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn conn_err(e: impl ToString) -> EngineError {
    EngineError::connection("kick", e.to_string())
}

// ── Connector ──────────────────────────────────────────────────────────

pub struct KickConnector {
    settings: KickSettings,
    http: reqwest::Client,
}

impl KickConnector {
    pub fn new(settings: KickSettings, http: reqwest::Client) -> Self {
        KickConnector { settings, http }
    }

    fn socket_url(&self) -> String {
        format!(
            "wss://ws-{}.pusher.com/app/{}?protocol=7&client=js&version=7.6.0&flash=false",
            self.settings.cluster, self.settings.pusher_key
        )
    }

    /// `GET /api/v2/channels/{slug}` → `chatroom.id`.
    async fn chatroom_id(&self, slug: &str) -> EngineResult<String> {
        let url = format!("{}/api/v2/channels/{}", self.settings.api_base.trim_end_matches('/'), urlencoding::encode(slug));
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(conn_err)?;
        if !resp.status().is_success() {
            return Err(conn_err(format!("channel lookup for {} returned {}", slug, resp.status())));
        }
        let body: Value = resp.json().await.map_err(conn_err)?;
        chatroom_from_channel(&body).ok_or_else(|| conn_err(format!("no chatroom for channel {}", slug)))
    }
}

#[async_trait]
impl PlatformConnector for KickConnector {
    fn platform(&self) -> Platform {
        Platform::Kick
    }

    async fn open(&self, key: &ChannelKey, resume: Option<&SessionCursor>) -> EngineResult<Box<dyn PlatformSession>> {
        let chatroom = match resume.and_then(|c| c.resolved_id.clone()) {
            Some(id) => id,
            None => self.chatroom_id(&key.channel).await?,
        };

        let (ws_stream, _) = connect_async(self.socket_url()).await.map_err(conn_err)?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Subscribing before connection_established gets silently ignored
        let established = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(t)) => match parse_pusher_frame(&t) {
                        PusherFrame::Established => return Ok(()),
                        PusherFrame::Error(e) => return Err(conn_err(e)),
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(e) => return Err(conn_err(e)),
                }
            }
            Err(conn_err("closed during handshake"))
        })
        .await
        .map_err(|_| conn_err("handshake timeout"))?;
        established?;

        let channel = format!("chatrooms.{}.v2", chatroom);
        let subscribe = json!({ "event": "pusher:subscribe", "data": { "auth": "", "channel": channel } });
        ws_tx.send(WsMessage::Text(subscribe.to_string())).await.map_err(conn_err)?;
        info!("[kick] Subscribed to {} ({})", key.channel, channel);

        Ok(Box::new(KickSession { slug: key.channel.clone(), chatroom, tx: ws_tx, rx: ws_rx }))
    }
}

// ── Session ────────────────────────────────────────────────────────────

struct KickSession {
    slug: String,
    chatroom: String,
    tx: SplitSink<WsStream, WsMessage>,
    rx: SplitStream<WsStream>,
}

impl KickSession {
    async fn send_event(&mut self, event: &str) -> EngineResult<()> {
        let frame = json!({ "event": event, "data": {} });
        self.tx.send(WsMessage::Text(frame.to_string())).await.map_err(conn_err)
    }
}

#[async_trait]
impl PlatformSession for KickSession {
    async fn next_delivery(&mut self) -> EngineResult<Delivery> {
        let frame = tokio::select! {
            frame = self.rx.next() => frame,
            _ = tokio::time::sleep(KEEPALIVE) => {
                self.send_event("pusher:ping").await?;
                return Ok(Delivery::Idle);
            }
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(t))) => t,
            Some(Ok(WsMessage::Close(_))) | None => return Err(conn_err("connection closed")),
            Some(Ok(_)) => return Ok(Delivery::Idle),
            Some(Err(e)) => return Err(conn_err(e)),
        };

        match parse_pusher_frame(&text) {
            PusherFrame::Chat(event) => {
                debug!("[kick] {} in {}: {}", event.username, self.slug, preview(&event.content));
                Ok(Delivery::Push(vec![RawEvent::Kick(event)]))
            }
            PusherFrame::Ping => {
                self.send_event("pusher:pong").await?;
                Ok(Delivery::Idle)
            }
            PusherFrame::Error(e) => Err(conn_err(e)),
            PusherFrame::Established | PusherFrame::Subscribed | PusherFrame::Other => Ok(Delivery::Idle),
        }
    }

    fn cursor(&self) -> SessionCursor {
        SessionCursor { resolved_id: Some(self.chatroom.clone()), ..SessionCursor::default() }
    }

    async fn close(&mut self) {
        let unsubscribe = json!({
            "event": "pusher:unsubscribe",
            "data": { "channel": format!("chatrooms.{}.v2", self.chatroom) }
        });
        let _ = self.tx.send(WsMessage::Text(unsubscribe.to_string())).await;
        if let Err(e) = self.tx.close().await {
            warn!("[kick] Close failed for {}: {}", self.slug, e);
        }
    }
}

// ── Pusher protocol ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum PusherFrame {
    Established,
    Subscribed,
    Ping,
    Chat(KickChatEvent),
    Error(String),
    Other,
}

/// Pusher sends `data` as a JSON-encoded string; tolerate a plain object too.
fn frame_data(frame: &Value) -> Option<Value> {
    match frame.get("data")? {
        Value::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

pub fn parse_pusher_frame(raw: &str) -> PusherFrame {
    let Ok(frame) = serde_json::from_str::<Value>(raw) else {
        return PusherFrame::Other;
    };
    match frame.get("event").and_then(Value::as_str).unwrap_or("") {
        "pusher:connection_established" => PusherFrame::Established,
        "pusher_internal:subscription_succeeded" => PusherFrame::Subscribed,
        "pusher:ping" => PusherFrame::Ping,
        "pusher:error" => {
            let message = frame_data(&frame)
                .and_then(|d| d.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| "pusher error".into());
            PusherFrame::Error(message)
        }
        CHAT_EVENT => frame_data(&frame).and_then(|d| chat_event(&d)).map(PusherFrame::Chat).unwrap_or(PusherFrame::Other),
        _ => PusherFrame::Other,
    }
}

fn chat_event(data: &Value) -> Option<KickChatEvent> {
    let content = data.get("content")?.as_str()?;
    let username = data.get("sender")?.get("username")?.as_str()?;
    let id = match data.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    Some(KickChatEvent {
        id,
        username: username.to_string(),
        content: content.to_string(),
        created_at: data.get("created_at").and_then(Value::as_str).map(String::from),
    })
}

fn chatroom_from_channel(body: &Value) -> Option<String> {
    let id = body.get("chatroom").and_then(|c| c.get("id")).or_else(|| body.get("id"))?;
    match id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
