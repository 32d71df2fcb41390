// Chorus Platforms — Twitch
//
// Read-only chat via IRC over WebSocket: wss://irc-ws.chat.twitch.tv
// Anonymous `justinfan` login, so no OAuth token is needed to read.
// Tags carry the display name, message id and send timestamp.

use super::preview;
use crate::config::TwitchSettings;
use async_trait::async_trait;
use chorus_core::atoms::traits::{Delivery, PlatformConnector, PlatformSession};
use chorus_core::{ChannelKey, EngineError, EngineResult, Platform, RawEvent, SessionCursor, TwitchPrivmsg};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEEPALIVE: Duration = Duration::from_secs(300);
const AUTH_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_MAX_FRAMES: usize = 30;

fn conn_err(e: impl ToString) -> EngineError {
    EngineError::connection("twitch", e.to_string())
}

// ── Connector ──────────────────────────────────────────────────────────

pub struct TwitchConnector {
    settings: TwitchSettings,
}

impl TwitchConnector {
    pub fn new(settings: TwitchSettings) -> Self {
        TwitchConnector { settings }
    }
}

#[async_trait]
impl PlatformConnector for TwitchConnector {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    async fn open(&self, key: &ChannelKey, _resume: Option<&SessionCursor>) -> EngineResult<Box<dyn PlatformSession>> {
        let (ws_stream, _) = connect_async(self.settings.url.as_str()).await.map_err(conn_err)?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let nick = self.settings.nick.to_lowercase();
        ws_tx.send(WsMessage::Text(format!("NICK {}", nick))).await.map_err(conn_err)?;
        ws_tx
            .send(WsMessage::Text("CAP REQ :twitch.tv/tags twitch.tv/commands".into()))
            .await
            .map_err(conn_err)?;

        // Wait for the welcome (001) or end of MOTD (376)
        let mut welcomed = false;
        for _ in 0..AUTH_MAX_FRAMES {
            let frame = match tokio::time::timeout(AUTH_FRAME_TIMEOUT, ws_rx.next()).await {
                Ok(Some(Ok(WsMessage::Text(t)))) => t,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(conn_err(e)),
                Ok(None) => return Err(conn_err("closed during login")),
                Err(_) => break,
            };
            for line in frame.lines() {
                if let Some(pong) = pong_for(line) {
                    ws_tx.send(WsMessage::Text(pong)).await.map_err(conn_err)?;
                }
                if command_of(line) == Some("NOTICE") && line.contains("Login authentication failed") {
                    return Err(conn_err("login rejected"));
                }
                if matches!(command_of(line), Some("001") | Some("376")) {
                    welcomed = true;
                }
            }
            if welcomed {
                break;
            }
        }
        if !welcomed {
            return Err(conn_err("login timeout"));
        }

        let channel = format!("#{}", key.channel);
        ws_tx.send(WsMessage::Text(format!("JOIN {}", channel))).await.map_err(conn_err)?;
        info!("[twitch] Joined {} as {}", channel, nick);

        Ok(Box::new(TwitchSession { channel, tx: ws_tx, rx: ws_rx }))
    }
}

// ── Session ────────────────────────────────────────────────────────────

struct TwitchSession {
    channel: String,
    tx: SplitSink<WsStream, WsMessage>,
    rx: SplitStream<WsStream>,
}

#[async_trait]
impl PlatformSession for TwitchSession {
    async fn next_delivery(&mut self) -> EngineResult<Delivery> {
        let frame = tokio::select! {
            frame = self.rx.next() => frame,
            _ = tokio::time::sleep(KEEPALIVE) => {
                self.tx.send(WsMessage::Text("PING :tmi.twitch.tv".into())).await.map_err(conn_err)?;
                return Ok(Delivery::Idle);
            }
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(t))) => t,
            Some(Ok(WsMessage::Ping(payload))) => {
                self.tx.send(WsMessage::Pong(payload)).await.map_err(conn_err)?;
                return Ok(Delivery::Idle);
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(conn_err("connection closed")),
            Some(Ok(_)) => return Ok(Delivery::Idle),
            Some(Err(e)) => return Err(conn_err(e)),
        };

        let mut events = Vec::new();
        for line in text.lines() {
            if let Some(pong) = pong_for(line) {
                self.tx.send(WsMessage::Text(pong)).await.map_err(conn_err)?;
                continue;
            }
            match command_of(line) {
                Some("RECONNECT") => return Err(conn_err("server requested reconnect")),
                Some("PRIVMSG") => {
                    if let Some(msg) = parse_privmsg(line) {
                        debug!("[twitch] {} in {}: {}", msg.login, self.channel, preview(&msg.text));
                        events.push(RawEvent::Twitch(msg));
                    }
                }
                _ => {}
            }
        }

        Ok(if events.is_empty() { Delivery::Idle } else { Delivery::Push(events) })
    }

    fn cursor(&self) -> SessionCursor {
        SessionCursor::default()
    }

    async fn close(&mut self) {
        let _ = self.tx.send(WsMessage::Text(format!("PART {}", self.channel))).await;
        if let Err(e) = self.tx.close().await {
            warn!("[twitch] Close failed for {}: {}", self.channel, e);
        }
    }
}

// ── IRC parsing ────────────────────────────────────────────────────────

fn pong_for(line: &str) -> Option<String> {
    line.starts_with("PING").then(|| line.replacen("PING", "PONG", 1))
}

/// Split `@tags :prefix COMMAND rest` into its parts.
fn split_line(line: &str) -> (&str, &str, &str) {
    let (tags, rest) = match line.strip_prefix('@') {
        Some(tagged) => tagged.split_once(' ').unwrap_or((tagged, "")),
        None => ("", line),
    };
    let (prefix, rest) = match rest.strip_prefix(':') {
        Some(prefixed) => prefixed.split_once(' ').unwrap_or((prefixed, "")),
        None => ("", rest),
    };
    (tags, prefix, rest)
}

fn command_of(line: &str) -> Option<&str> {
    let (_, _, rest) = split_line(line);
    rest.split(' ').next().filter(|c| !c.is_empty())
}

/// Parse `@tags :nick!user@host PRIVMSG #channel :message`.
pub fn parse_privmsg(line: &str) -> Option<TwitchPrivmsg> {
    let (tags, prefix, rest) = split_line(line);
    let after = rest.strip_prefix("PRIVMSG ")?;
    let (_channel, content) = after.split_once(" :")?;
    let login = prefix.split('!').next().unwrap_or("").trim();
    if login.is_empty() || content.trim().is_empty() {
        return None;
    }
    // CTCP ACTION (/me) arrives wrapped in \x01ACTION ...\x01
    let content = content
        .strip_prefix("\u{1}ACTION ")
        .map(|s| s.trim_end_matches('\u{1}'))
        .unwrap_or(content);

    Some(TwitchPrivmsg {
        id: parse_tag(tags, "id").filter(|v| !v.is_empty()),
        login: login.to_string(),
        display_name: parse_tag(tags, "display-name").filter(|v| !v.is_empty()),
        text: content.to_string(),
        sent_ts_ms: parse_tag(tags, "tmi-sent-ts").and_then(|v| v.parse().ok()),
    })
}

/// Parse a single IRC tag value from the tags string (key1=val1;key2=val2;...)
fn parse_tag(tags: &str, key: &str) -> Option<String> {
    for pair in tags.split(';') {
        let mut kv = pair.splitn(2, '=');
        if kv.next() == Some(key) {
            return kv.next().map(unescape_tag);
        }
    }
    None
}

fn unescape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "@badge-info=;color=#1E90FF;display-name=Cool\\sViewer;id=4a1b-22;tmi-sent-ts=1700000000123 \
                        :coolviewer!coolviewer@coolviewer.tmi.twitch.tv PRIVMSG #abc :what time does the stream end?";

    #[test]
    fn test_parse_privmsg_with_tags() {
        let msg = parse_privmsg(LINE).unwrap();
        assert_eq!(msg.login, "coolviewer");
        assert_eq!(msg.display_name.as_deref(), Some("Cool Viewer"));
        assert_eq!(msg.id.as_deref(), Some("4a1b-22"));
        assert_eq!(msg.sent_ts_ms, Some(1_700_000_000_123));
        assert_eq!(msg.text, "what time does the stream end?");
    }

    #[test]
    fn test_parse_privmsg_without_tags() {
        let msg = parse_privmsg(":bob!bob@bob.tmi.twitch.tv PRIVMSG #abc :hello: world").unwrap();
        assert_eq!(msg.login, "bob");
        assert_eq!(msg.display_name, None);
        assert_eq!(msg.id, None);
        assert_eq!(msg.text, "hello: world");
    }

    #[test]
    fn test_action_is_unwrapped() {
        let msg = parse_privmsg(":bob!bob@host PRIVMSG #abc :\u{1}ACTION waves\u{1}").unwrap();
        assert_eq!(msg.text, "waves");
    }

    #[test]
    fn test_non_privmsg_lines() {
        assert!(parse_privmsg(":tmi.twitch.tv 001 justinfan12345 :Welcome, GLHF!").is_none());
        assert_eq!(command_of(":tmi.twitch.tv 001 justinfan12345 :Welcome"), Some("001"));
        assert_eq!(command_of("@msg-id=x :tmi.twitch.tv NOTICE * :Login authentication failed"), Some("NOTICE"));
        assert_eq!(command_of(":tmi.twitch.tv RECONNECT"), Some("RECONNECT"));
        assert_eq!(pong_for("PING :tmi.twitch.tv").as_deref(), Some("PONG :tmi.twitch.tv"));
        assert!(pong_for(":x PRIVMSG #a :PING").is_none());
    }

    #[test]
    fn test_parse_tag() {
        let tags = "display-name=Foo;id=abc;emotes=";
        assert_eq!(parse_tag(tags, "display-name"), Some("Foo".into()));
        assert_eq!(parse_tag(tags, "emotes"), Some(String::new()));
        assert_eq!(parse_tag(tags, "missing"), None);
    }
}
