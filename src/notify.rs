//! Push-notification sink.
//!
//! Delivery is someone else's problem; the router only hands over a
//! [`Notification`] and moves on.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other.
    pub tag: String,
    pub require_interaction: bool,
    pub data: Value,
}

/// Fire-and-forget notification delivery. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs notifications instead of showing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        info!(tag = %n.tag, title = %n.title, body = %n.body, "notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_shape() {
        let n = Notification {
            title: "New message".to_string(),
            body: "hi".to_string(),
            tag: "chat-c1".to_string(),
            require_interaction: false,
            data: serde_json::json!({"channel_id": "c1"}),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["requireInteraction"], false);
        assert_eq!(v["data"]["channel_id"], "c1");
    }
}
