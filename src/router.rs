//! Message Router: maps each inbound envelope to its effect.
//!
//! Coarse `*_update` frames only invalidate (the coordinator refetches).
//! Fine-grained chat and reschedule frames carry their payload, which is
//! applied to the store, published on the local bus and, when it concerns
//! someone other than the current user, surfaced as a notification.
//!
//! Nothing here does network I/O and nothing here can fail past the router:
//! malformed frames are logged and dropped.

use crate::bus::{ChatEvent, ChatRead, LocalEventBus};
use crate::coordinator::{Signal, SyncCoordinator};
use crate::envelope::{self, InboundEnvelope, InboundMessage};
use crate::model::{ChatMessage, Reschedule, RescheduleStatus};
use crate::notify::{Notification, Notifier};
use crate::session::SessionContext;
use crate::store::{DataStore, SyncTarget};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Full resync started (handshake).
    Resync,
    Invalidated(SyncTarget, Signal),
    /// Applied locally and delivered to this many bus listeners.
    Published(usize),
    /// Heartbeat ack or unknown tag.
    Ignored,
    /// Could not be decoded.
    Dropped,
}

pub struct MessageRouter {
    session: Arc<SessionContext>,
    coordinator: Arc<SyncCoordinator>,
    store: Arc<DataStore>,
    bus: Arc<LocalEventBus>,
    notifier: Arc<dyn Notifier>,
}

impl MessageRouter {
    pub fn new(
        session: Arc<SessionContext>,
        coordinator: Arc<SyncCoordinator>,
        store: Arc<DataStore>,
        bus: Arc<LocalEventBus>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            session,
            coordinator,
            store,
            bus,
            notifier,
        }
    }

    /// Decode and dispatch one text frame.
    pub fn route_frame(&self, text: &str) -> Routed {
        match envelope::decode(text) {
            Ok(env) => self.dispatch(env),
            Err(e) => {
                warn!(error = %e, "dropping inbound frame");
                Routed::Dropped
            }
        }
    }

    pub fn dispatch(&self, env: InboundEnvelope) -> Routed {
        trace!(kind = env.message.kind(), ts = ?env.server_timestamp, "inbound");
        match env.message {
            InboundMessage::Connected => {
                debug!("handshake received, starting full sync");
                self.coordinator.spawn_sync_all();
                Routed::Resync
            }
            InboundMessage::Pong => Routed::Ignored,
            InboundMessage::RequestUpdate(_) => self.invalidate(SyncTarget::Requests),
            InboundMessage::MeetingUpdate(_) => self.invalidate(SyncTarget::Meetings),
            InboundMessage::ExecutorUpdate(_) => self.invalidate(SyncTarget::Executors),
            InboundMessage::AnnouncementUpdate(_) => self.invalidate(SyncTarget::Announcements),
            InboundMessage::ChatMessage(message) => self.on_chat_message(message),
            InboundMessage::ChatRead(read) => self.on_chat_read(read),
            InboundMessage::RescheduleUpdate(reschedule) => self.on_reschedule(reschedule),
            InboundMessage::Unknown { kind } => {
                debug!(%kind, "ignoring unknown envelope type");
                Routed::Ignored
            }
        }
    }

    fn invalidate(&self, target: SyncTarget) -> Routed {
        Routed::Invalidated(target, self.coordinator.signal(target))
    }

    fn on_chat_message(&self, message: ChatMessage) -> Routed {
        let from_other = message.sender_id != self.session.user_id;
        if !self.store.apply_chat_message(&message, from_other) {
            debug!(id = %message.id, channel = %message.channel_id, "chat message already applied");
            return Routed::Ignored;
        }

        if from_other {
            self.notifier.notify(Notification {
                title: message
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| "New message".to_string()),
                body: message.content.clone(),
                tag: format!("chat-{}", message.channel_id),
                require_interaction: false,
                data: json!({
                    "channel_id": message.channel_id,
                    "message_id": message.id,
                }),
            });
        }

        Routed::Published(self.bus.chat.publish(&ChatEvent::Message(message)))
    }

    fn on_chat_read(&self, read: ChatRead) -> Routed {
        if read.user_id == self.session.user_id {
            self.store.mark_channel_read(&read.channel_id);
        }
        Routed::Published(self.bus.chat.publish(&ChatEvent::Read(read)))
    }

    fn on_reschedule(&self, reschedule: Reschedule) -> Routed {
        let newly_proposed = reschedule.status == RescheduleStatus::Pending
            && self.store.reschedules.get(&reschedule.id).is_none()
            && reschedule.proposed_by != self.session.user_id;

        self.store.apply_reschedule(reschedule.clone());

        if newly_proposed {
            self.notifier.notify(Notification {
                title: "Reschedule proposed".to_string(),
                body: format!(
                    "New visit time proposed: {}",
                    reschedule.proposed_date.format("%Y-%m-%d %H:%M")
                ),
                tag: format!("reschedule-{}", reschedule.id),
                require_interaction: true,
                data: json!({
                    "reschedule_id": reschedule.id,
                    "request_id": reschedule.request_id,
                }),
            });
        }

        Routed::Published(self.bus.reschedule.publish(&reschedule))
    }
}
