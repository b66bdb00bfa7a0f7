//! Local Event Bus.
//!
//! In-process fan-out of fine-grained realtime events to whoever is
//! currently interested (an open chat view, a reschedule banner, ...).
//! One bus instance exists per session; each event family has its own
//! registry so chat and reschedule listeners never see each other's events.
//!
//! - `subscribe` returns a [`Subscription`]; dropping it or calling
//!   [`Subscription::unsubscribe`] removes the listener.
//! - `publish` calls every listener registered at the time of the call.
//!   A panicking listener is logged and skipped; the rest still run.

use crate::model::{ChatMessage, EntityId, Reschedule};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Registry<E> = Mutex<BTreeMap<u64, Listener<E>>>;

/// A single family of listeners.
pub struct EventBus<E> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: Arc<Registry<E>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(0),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        trace!(bus = self.name, id, "listener added");

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.listeners);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().remove(&id);
                }
            })),
        }
    }

    /// Deliver `event` to every current listener. Returns how many ran to
    /// completion.
    pub fn publish(&self, event: &E) -> usize {
        // Snapshot so listeners may subscribe/unsubscribe re-entrantly.
        let snapshot: Vec<(u64, Listener<E>)> = self
            .listeners
            .lock()
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    warn!(bus = self.name, listener = id, panic = %msg, "listener panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

/// Handle to a registered listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the listener registered for the life of the bus.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

// ---------------------------------------------------------------------------
// Event families
// ---------------------------------------------------------------------------

/// A channel was read by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRead {
    pub channel_id: EntityId,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Read(ChatRead),
}

/// Per-session bus with one registry per event family.
pub struct LocalEventBus {
    pub chat: EventBus<ChatEvent>,
    pub reschedule: EventBus<Reschedule>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            chat: EventBus::new("chat"),
            reschedule: EventBus::new("reschedule"),
        }
    }

    /// Session teardown.
    pub fn clear(&self) {
        self.chat.clear();
        self.reschedule.clear();
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}
