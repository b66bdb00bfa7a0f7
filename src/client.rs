//! Per-session wiring.
//!
//! A [`RealtimeSession`] exists from the moment a token is available until
//! logout. It owns the store, the local bus, the coordinator and the
//! connection driver, and tears all of them down together.

use crate::api::CrmApi;
use crate::bus::LocalEventBus;
use crate::config::RealtimeConfig;
use crate::connection::{ConnectionHandle, ConnectionParts, SessionSignal};
use crate::coordinator::SyncCoordinator;
use crate::machine::ConnectionState;
use crate::notify::Notifier;
use crate::router::MessageRouter;
use crate::session::SessionContext;
use crate::store::DataStore;
use crate::transport::Connector;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub struct RealtimeSession {
    session: Arc<SessionContext>,
    store: Arc<DataStore>,
    bus: Arc<LocalEventBus>,
    coordinator: Arc<SyncCoordinator>,
    connection: ConnectionHandle,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
}

impl RealtimeSession {
    /// Wire up a session and start connecting. Must be called within a
    /// tokio runtime.
    pub fn start(
        config: RealtimeConfig,
        session: SessionContext,
        api: Arc<dyn CrmApi>,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let session = Arc::new(session);
        let store = Arc::new(DataStore::new(api));
        let bus = Arc::new(LocalEventBus::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            session.role,
            config.debounce(),
        ));
        let router = Arc::new(MessageRouter::new(
            session.clone(),
            coordinator.clone(),
            store.clone(),
            bus.clone(),
            notifier,
        ));

        info!(user = %session.user_id, role = %session.role, transport = ?config.transport, "starting realtime session");
        let (connection, signals) = ConnectionHandle::spawn(ConnectionParts {
            config,
            session: session.clone(),
            connector,
            router,
            coordinator: coordinator.clone(),
        });
        connection.connect();

        Self {
            session,
            store,
            bus,
            coordinator,
            connection,
            signals,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<LocalEventBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    pub fn set_visible(&self, visible: bool) {
        self.connection.set_visible(visible);
    }

    /// Resync now, reconnecting immediately if the channel is down.
    pub fn refresh(&self) {
        self.connection.refresh();
    }

    /// Next escalation from the connection; `None` once it has stopped.
    pub async fn next_signal(&mut self) -> Option<SessionSignal> {
        self.signals.recv().await
    }

    /// Logout: close the channel, stop refetching, drop every listener.
    pub async fn shutdown(self) {
        info!(user = %self.session.user_id, "ending realtime session");
        self.coordinator.close();
        self.connection.shutdown().await;
        self.bus.clear();
    }
}
