//! Realtime layer configuration.
//!
//! Defaults are the production values. `RealtimeConfig::from_env()` overlays
//! `FACILITY_*` environment variables on top of them; a variable that is
//! unset or fails to parse leaves the default in place.
//!
//! Environment:
//!   FACILITY_API_URL             - REST/realtime base URL (default: http://localhost:3000)
//!   FACILITY_TRANSPORT           - `websocket` or `sse` (default: websocket)
//!   FACILITY_RECONNECT_BASE_MS   - first backoff delay (default: 1000)
//!   FACILITY_RECONNECT_CAP_MS    - backoff ceiling (default: 30000)
//!   FACILITY_RECONNECT_ATTEMPTS  - attempts before polling (default: 10)
//!   FACILITY_HEARTBEAT_MS        - ping interval while open (default: 30000)
//!   FACILITY_PONG_TIMEOUT_MS     - liveness timeout after a ping (default: off)
//!   FACILITY_DEBOUNCE_MS         - refetch coalescing window (default: 500)
//!   FACILITY_POLL_INTERVAL_MS    - fallback polling period (default: 5000)

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Which realtime channel to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// `/api/ws?token=…`. Bidirectional; carries heartbeats.
    Websocket,
    /// `/api/events?token=…`. Legacy receive-only stream.
    Sse,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "sse" | "events" => Ok(TransportKind::Sse),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_url: String,
    pub transport: TransportKind,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// No liveness timeout when `None`; only transport close/error is trusted.
    pub pong_timeout_ms: Option<u64>,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            transport: TransportKind::Websocket,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: None,
            debounce_ms: 500,
            poll_interval_ms: 5_000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("FACILITY_API_URL") {
            config.base_url = url;
        }
        if let Some(kind) = env_parse("FACILITY_TRANSPORT") {
            config.transport = kind;
        }
        if let Some(v) = env_parse("FACILITY_RECONNECT_BASE_MS") {
            config.reconnect_base_ms = v;
        }
        if let Some(v) = env_parse("FACILITY_RECONNECT_CAP_MS") {
            config.reconnect_cap_ms = v;
        }
        if let Some(v) = env_parse("FACILITY_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = env_parse("FACILITY_HEARTBEAT_MS") {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("FACILITY_PONG_TIMEOUT_MS") {
            config.pong_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse("FACILITY_DEBOUNCE_MS") {
            config.debounce_ms = v;
        }
        if let Some(v) = env_parse("FACILITY_POLL_INTERVAL_MS") {
            config.poll_interval_ms = v;
        }

        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout_ms.map(Duration::from_millis)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Channel URL for the configured transport, token in the query string.
    pub fn channel_url(&self, token: &str) -> Result<Url, TransportError> {
        match self.transport {
            TransportKind::Websocket => self.ws_url(token),
            TransportKind::Sse => self.sse_url(token),
        }
    }

    /// `ws(s)://<host>/api/ws?token=<token>`
    pub fn ws_url(&self, token: &str) -> Result<Url, TransportError> {
        let mut url = self.endpoint("/api/ws", token)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;
        Ok(url)
    }

    /// `http(s)://<host>/api/events?token=<token>`
    pub fn sse_url(&self, token: &str) -> Result<Url, TransportError> {
        let mut url = self.endpoint("/api/events", token)?;
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            _ => "http",
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str, token: &str) -> Result<Url, TransportError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        let mut url = base
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_https_base() {
        let config = RealtimeConfig {
            base_url: "https://crm.example.com".to_string(),
            ..Default::default()
        };
        let url = config.ws_url("abc123").unwrap();
        assert_eq!(url.as_str(), "wss://crm.example.com/api/ws?token=abc123");
    }

    #[test]
    fn test_ws_url_from_plain_http_base() {
        let config = RealtimeConfig::default();
        let url = config.ws_url("t").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/api/ws?token=t");
    }

    #[test]
    fn test_sse_url_encodes_token() {
        let config = RealtimeConfig {
            base_url: "https://crm.example.com".to_string(),
            transport: TransportKind::Sse,
            ..Default::default()
        };
        let url = config.channel_url("a b&c").unwrap();
        assert_eq!(url.path(), "/api/events");
        assert_eq!(url.scheme(), "https");
        let token: Vec<_> = url.query_pairs().collect();
        assert_eq!(token[0].1, "a b&c");
    }

    #[test]
    fn test_invalid_base_url() {
        let config = RealtimeConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.ws_url("t"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RealtimeConfig =
            serde_json::from_str(r#"{"debounce_ms": 250, "transport": "sse"}"#).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.transport, TransportKind::Sse);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }
}
