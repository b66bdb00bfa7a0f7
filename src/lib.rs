//! Facility CRM realtime sync layer.
//!
//! Keeps a client's in-memory view of requests, chat, announcements,
//! meetings and reschedule proposals consistent with the server: one
//! realtime channel per session (WebSocket, SSE as a fallback variant),
//! debounced refetches on invalidation, polling when the channel cannot be
//! kept up, and optimistic create/update/delete with rollback.

pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod machine;
pub mod model;
pub mod notify;
pub mod router;
pub mod session;
pub mod stats;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use api::{CrmApi, HttpApi};
pub use bus::{ChatEvent, LocalEventBus, Subscription};
pub use client::RealtimeSession;
pub use config::{RealtimeConfig, TransportKind};
pub use connection::SessionSignal;
pub use error::{ApiError, EnvelopeError, StoreError, TransportError};
pub use machine::{CloseReason, ConnectionState};
pub use notify::{Notification, Notifier, TracingNotifier};
pub use session::{Role, SessionContext};
pub use store::{DataStore, SyncTarget};
