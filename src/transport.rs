//! Realtime channel abstraction and its two implementations.
//!
//! - [`WsConnector`]: WebSocket at `/api/ws?token=…`, bidirectional.
//! - [`SseConnector`]: `text/event-stream` at `/api/events?token=…`,
//!   receive-only; the driver skips heartbeats for it.
//!
//! The token travels in the query string because neither browser-native
//! channel can carry an `Authorization` header, and the server contract
//! is shared with those clients.

use crate::config::{RealtimeConfig, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close codes the server uses to reject a session token.
pub const AUTH_CLOSE_CODES: [u16; 3] = [1008, 4001, 4003];

pub fn is_auth_close(code: Option<u16>) -> bool {
    code.map(|c| AUTH_CLOSE_CODES.contains(&c)).unwrap_or(false)
}

/// One inbound item from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// The peer closed the channel.
    Close { code: Option<u16>, reason: String },
}

/// An open realtime channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether `send` can work at all (heartbeats are skipped otherwise).
    fn supports_send(&self) -> bool {
        true
    }
}

/// Opens channels.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>, TransportError>;
}

/// Connector matching the configured transport.
pub fn connector_for(config: &RealtimeConfig) -> Result<Arc<dyn Connector>, TransportError> {
    Ok(match config.transport {
        TransportKind::Websocket => Arc::new(WsConnector),
        TransportKind::Sse => Arc::new(SseConnector::new()?),
    })
}

fn status_error(status: u16, detail: String) -> TransportError {
    match status {
        401 | 403 => TransportError::Unauthorized(format!("HTTP {}", status)),
        _ if detail.is_empty() => TransportError::ConnectionFailed(format!("HTTP {}", status)),
        _ => TransportError::ConnectionFailed(format!("HTTP {}: {}", status, detail)),
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>, TransportError> {
        debug!(host = url.host_str().unwrap_or(""), path = url.path(), "opening websocket");
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                return Err(status_error(status, body));
            }
            Ok(Err(tungstenite::Error::Io(e))) => return Err(TransportError::Io(e)),
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "timed out after {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        };
        Ok(Box::new(WsChannel { stream }))
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(TransportError::ConnectionFailed(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => trace!("skipping non-utf8 binary frame"),
                },
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Frame::Close { code, reason }));
                }
                // Control frames are answered by tungstenite.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(TransportError::Closed {
                code: None,
                reason: e.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server-Sent Events
// ---------------------------------------------------------------------------

pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Result<Self, TransportError> {
        // No overall timeout: the response body is the long-lived stream.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>, TransportError> {
        debug!(host = url.host_str().unwrap_or(""), path = url.path(), "opening event stream");
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
            })
            .boxed();

        Ok(Box::new(SseChannel {
            stream,
            parser: SseParser::default(),
            ready: VecDeque::new(),
        }))
    }
}

pub struct SseChannel {
    stream: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    parser: SseParser,
    ready: VecDeque<String>,
}

#[async_trait]
impl Channel for SseChannel {
    async fn send(&mut self, _text: String) -> Result<(), TransportError> {
        Err(TransportError::Protocol(
            "event stream is receive-only".to_string(),
        ))
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            if let Some(data) = self.ready.pop_front() {
                return Some(Ok(Frame::Text(data)));
            }
            match self.stream.next().await? {
                Ok(chunk) => self.ready.extend(self.parser.feed(&chunk)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream = futures::stream::empty().boxed();
        self.ready.clear();
        Ok(())
    }

    fn supports_send(&self) -> bool {
        false
    }
}

/// Incremental `text/event-stream` parser. Yields the `data` of each
/// dispatched event; comments and `ping` events are dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(data) = self.dispatch() {
                    out.push(data);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<String> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        if event.as_deref() == Some("ping") {
            return None;
        }
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_close_codes() {
        assert!(is_auth_close(Some(4001)));
        assert!(is_auth_close(Some(1008)));
        assert!(!is_auth_close(Some(1006)));
        assert!(!is_auth_close(None));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(status_error(401, String::new()).is_auth());
        assert!(status_error(403, "nope".to_string()).is_auth());
        assert!(!status_error(502, String::new()).is_auth());
    }

    #[test]
    fn test_sse_parser_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"type\":\"request").is_empty());
        let out = parser.feed(b"_update\"}\n\n: keepalive\n\ndata: {\"type\":\"pong\"}\r\n\r\n");
        assert_eq!(
            out,
            vec![
                r#"{"type":"request_update"}"#.to_string(),
                r#"{"type":"pong"}"#.to_string()
            ]
        );
    }

    #[test]
    fn test_sse_parser_multiline_and_ping_events() {
        let mut parser = SseParser::default();
        let out = parser.feed(b"event: ping\ndata: 1\n\nevent: message\ndata: a\ndata: b\n\n");
        assert_eq!(out, vec!["a\nb".to_string()]);
    }

    #[tokio::test]
    async fn test_sse_channel_is_receive_only() {
        let mut channel = SseChannel {
            stream: futures::stream::iter(vec![Ok(b"data: x\n\n".to_vec())]).boxed(),
            parser: SseParser::default(),
            ready: VecDeque::new(),
        };
        assert!(!channel.supports_send());
        assert!(channel.send("ping".to_string()).await.is_err());
        assert_eq!(channel.recv().await.unwrap().unwrap(), Frame::Text("x".to_string()));
        assert!(channel.recv().await.is_none());
    }
}
