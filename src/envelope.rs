//! Inbound realtime envelopes.
//!
//! Wire shape: `{ "type": "<tag>", "data": <payload>, "serverTimestamp"?: <ms> }`.
//! Decoding is two-step: the outer envelope first, then the payload for the
//! known tag. Unrecognized tags decode to [`InboundMessage::Unknown`]; a
//! recognized tag with an undecodable payload is an error the router drops.

use crate::bus::ChatRead;
use crate::error::EnvelopeError;
use crate::model::{ChatMessage, EntityId, Reschedule};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outer frame before payload interpretation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, alias = "serverTimestamp")]
    pub server_timestamp: Option<i64>,
}

/// Optional detail carried by coarse invalidation frames. Ignored for
/// refetching; only used for log context and notifications.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateHint {
    #[serde(default)]
    pub id: Option<EntityId>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Handshake; triggers a full initial sync.
    Connected,
    /// Heartbeat acknowledgement.
    Pong,
    RequestUpdate(UpdateHint),
    MeetingUpdate(UpdateHint),
    ExecutorUpdate(UpdateHint),
    AnnouncementUpdate(UpdateHint),
    ChatMessage(ChatMessage),
    ChatRead(ChatRead),
    RescheduleUpdate(Reschedule),
    Unknown { kind: String },
}

impl InboundMessage {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Connected => "connected",
            InboundMessage::Pong => "pong",
            InboundMessage::RequestUpdate(_) => "request_update",
            InboundMessage::MeetingUpdate(_) => "meeting_update",
            InboundMessage::ExecutorUpdate(_) => "executor_update",
            InboundMessage::AnnouncementUpdate(_) => "announcement_update",
            InboundMessage::ChatMessage(_) => "chat_message",
            InboundMessage::ChatRead(_) => "chat_read",
            InboundMessage::RescheduleUpdate(_) => "reschedule_update",
            InboundMessage::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message: InboundMessage,
    pub server_timestamp: Option<i64>,
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, EnvelopeError> {
    serde_json::from_value(data).map_err(|source| EnvelopeError::BadPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Hints are optional: a missing or null payload is an empty hint.
fn hint(kind: &str, data: Value) -> Result<UpdateHint, EnvelopeError> {
    if data.is_null() {
        return Ok(UpdateHint::default());
    }
    payload(kind, data)
}

impl InboundEnvelope {
    pub fn from_raw(raw: RawEnvelope) -> Result<Self, EnvelopeError> {
        let RawEnvelope {
            kind,
            data,
            server_timestamp,
        } = raw;

        let message = match kind.as_str() {
            "connected" => InboundMessage::Connected,
            "pong" => InboundMessage::Pong,
            "request_update" => InboundMessage::RequestUpdate(hint(&kind, data)?),
            "meeting_update" => InboundMessage::MeetingUpdate(hint(&kind, data)?),
            "executor_update" => InboundMessage::ExecutorUpdate(hint(&kind, data)?),
            "announcement_update" => InboundMessage::AnnouncementUpdate(hint(&kind, data)?),
            "chat_message" => InboundMessage::ChatMessage(payload(&kind, data)?),
            "chat_read" => InboundMessage::ChatRead(payload(&kind, data)?),
            "reschedule_update" => InboundMessage::RescheduleUpdate(payload(&kind, data)?),
            _ => InboundMessage::Unknown { kind },
        };

        Ok(Self {
            message,
            server_timestamp,
        })
    }
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<InboundEnvelope, EnvelopeError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    InboundEnvelope::from_raw(raw)
}

#[derive(Serialize)]
struct Outbound<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Heartbeat frame: `{"type":"ping"}`.
pub fn ping_frame() -> String {
    serde_json::to_string(&Outbound { kind: "ping" }).unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RescheduleStatus;

    #[test]
    fn test_decode_coarse_update_without_data() {
        let env = decode(r#"{"type":"request_update"}"#).unwrap();
        assert_eq!(env.message, InboundMessage::RequestUpdate(UpdateHint::default()));
        assert_eq!(env.server_timestamp, None);
    }

    #[test]
    fn test_decode_with_server_timestamp() {
        let env =
            decode(r#"{"type":"meeting_update","data":{"id":7},"serverTimestamp":1700000000000}"#)
                .unwrap();
        assert_eq!(env.server_timestamp, Some(1_700_000_000_000));
        match env.message {
            InboundMessage::MeetingUpdate(h) => assert_eq!(h.id, Some(EntityId::from("7"))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_chat_message() {
        let env = decode(
            r#"{"type":"chat_message","data":{"id":1,"channel_id":"c1","sender_id":"u2",
                "content":"hi","created_at":"2026-03-10T09:00:00Z"}}"#,
        )
        .unwrap();
        match env.message {
            InboundMessage::ChatMessage(m) => {
                assert_eq!(m.channel_id, EntityId::from("c1"));
                assert_eq!(m.content, "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_reschedule() {
        let env = decode(
            r#"{"type":"reschedule_update","data":{"id":"r1","request_id":5,
                "proposed_date":"2026-03-11T10:00:00Z","status":"pending"}}"#,
        )
        .unwrap();
        match env.message {
            InboundMessage::RescheduleUpdate(r) => assert_eq!(r.status, RescheduleStatus::Pending),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let env = decode(r#"{"type":"weather_alert","data":{"level":3}}"#).unwrap();
        assert_eq!(
            env.message,
            InboundMessage::Unknown {
                kind: "weather_alert".to_string()
            }
        );
        assert_eq!(env.message.kind(), "weather_alert");
    }

    #[test]
    fn test_known_tag_with_bad_payload() {
        let err = decode(r#"{"type":"chat_message","data":{"content":42}}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadPayload { ref kind, .. } if kind == "chat_message"));
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(decode("not json"), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(decode(r#"{"data":{}}"#), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_ping_frame() {
        assert_eq!(ping_frame(), r#"{"type":"ping"}"#);
    }
}
