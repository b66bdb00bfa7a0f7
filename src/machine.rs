//! Connection state machine.
//!
//! Pure: [`ConnectionMachine::handle`] takes one event and returns the
//! actions the async driver must perform. It owns the reconnect budget and
//! knows whether fallback polling is on; it never touches a socket or a
//! timer itself.
//!
//! Exactly one invalidation driver is active while a session is live:
//! the transport (`Connecting`, `Open`, `Reconnecting`) or polling
//! (`Polling`). Every transition out of `Polling` stops polling in the
//! same step, and polling only starts on entering `Polling`.

use crate::config::RealtimeConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called (logout, teardown).
    Manual,
    /// The server refused the session token. Needs re-authentication.
    AuthRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed { reason: CloseReason },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Polling,
}

impl ConnectionState {
    /// The transport, rather than polling, is responsible for invalidation.
    pub fn transport_driven(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed { reason } => write!(f, "closed({:?})", reason),
            ConnectionState::Reconnecting { attempt, delay_ms } => {
                write!(f, "reconnecting(attempt={}, delay={}ms)", attempt, delay_ms)
            }
            ConnectionState::Polling => write!(f, "polling"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect budget
// ---------------------------------------------------------------------------

/// Exponential backoff: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBudget {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub cap_ms: u64,
}

impl ReconnectBudget {
    pub fn new(max_attempts: u32, base_delay_ms: u64, cap_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            cap_ms,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            config.max_reconnect_attempts,
            config.reconnect_base_ms,
            config.reconnect_cap_ms,
        )
    }

    /// Delay for a given attempt number, saturating at the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.cap_ms);
        Duration::from_millis(ms)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Consume one attempt, returning its delay, or `None` when exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Events and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// Caller asked to connect.
    Connect,
    /// The channel finished its handshake.
    Opened,
    /// The channel failed to open, errored, or closed.
    Failed { auth: bool },
    /// The backoff delay elapsed.
    ReconnectDue,
    /// Caller asked to close.
    Close,
    /// The channel has been torn down after `Close`.
    Released,
    /// The UI became visible again.
    Foregrounded,
    /// Manual "sync now".
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenChannel,
    DropChannel,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartPolling,
    StopPolling,
    ResyncAll,
    ReauthRequired,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    budget: ReconnectBudget,
}

impl ConnectionMachine {
    pub fn new(budget: ReconnectBudget) -> Self {
        Self {
            state: ConnectionState::Idle,
            budget,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn budget(&self) -> &ReconnectBudget {
        &self.budget
    }

    pub fn polling(&self) -> bool {
        self.state == ConnectionState::Polling
    }

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Action> {
        let before = self.state.clone();
        let actions = match event {
            MachineEvent::Connect => self.on_connect(),
            MachineEvent::Opened => self.on_opened(),
            MachineEvent::Failed { auth } => self.on_failed(auth),
            MachineEvent::ReconnectDue => self.on_reconnect_due(),
            MachineEvent::Close => self.on_close(),
            MachineEvent::Released => self.on_released(),
            MachineEvent::Foregrounded | MachineEvent::Refresh => self.on_wake(),
        };
        if self.state != before {
            debug!(from = %before, to = %self.state, ?event, "connection state");
        }
        actions
    }

    fn on_connect(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Closing => {
                Vec::new()
            }
            ConnectionState::Closed {
                reason: CloseReason::AuthRejected,
            } => {
                warn!("connect refused: token was rejected, re-authenticate first");
                Vec::new()
            }
            ConnectionState::Reconnecting { .. } => {
                self.state = ConnectionState::Connecting;
                vec![Action::CancelReconnect, Action::OpenChannel]
            }
            ConnectionState::Polling => {
                self.state = ConnectionState::Connecting;
                vec![Action::StopPolling, Action::OpenChannel]
            }
            ConnectionState::Idle
            | ConnectionState::Closed {
                reason: CloseReason::Manual,
            } => {
                self.budget.reset();
                self.state = ConnectionState::Connecting;
                vec![Action::OpenChannel]
            }
        }
    }

    fn on_opened(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            // Late handshake for a channel we no longer want.
            return vec![Action::DropChannel];
        }
        self.budget.reset();
        self.state = ConnectionState::Open;
        info!("realtime channel open");
        vec![Action::StartHeartbeat]
    }

    fn on_failed(&mut self, auth: bool) -> Vec<Action> {
        let mut actions = match self.state {
            ConnectionState::Open => vec![Action::StopHeartbeat, Action::DropChannel],
            ConnectionState::Connecting => vec![Action::DropChannel],
            _ => return Vec::new(),
        };

        if auth {
            self.state = ConnectionState::Closed {
                reason: CloseReason::AuthRejected,
            };
            actions.push(Action::ReauthRequired);
            return actions;
        }

        match self.budget.next_delay() {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting {
                    attempt: self.budget.attempt,
                    delay_ms: delay.as_millis() as u64,
                };
                actions.push(Action::ScheduleReconnect(delay));
            }
            None => {
                warn!(
                    attempts = self.budget.attempt,
                    "reconnect budget exhausted, falling back to polling"
                );
                self.state = ConnectionState::Polling;
                actions.push(Action::StartPolling);
            }
        }
        actions
    }

    fn on_reconnect_due(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Reconnecting { .. } => {
                self.state = ConnectionState::Connecting;
                vec![Action::OpenChannel]
            }
            _ => Vec::new(),
        }
    }

    fn on_close(&mut self) -> Vec<Action> {
        let actions = match self.state {
            ConnectionState::Closing | ConnectionState::Closed { .. } => return Vec::new(),
            ConnectionState::Idle => Vec::new(),
            ConnectionState::Connecting => vec![Action::DropChannel],
            ConnectionState::Open => vec![Action::StopHeartbeat, Action::DropChannel],
            ConnectionState::Reconnecting { .. } => vec![Action::CancelReconnect],
            ConnectionState::Polling => vec![Action::StopPolling],
        };
        self.state = ConnectionState::Closing;
        actions
    }

    fn on_released(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Closing {
            self.state = ConnectionState::Closed {
                reason: CloseReason::Manual,
            };
        }
        Vec::new()
    }

    /// Visibility regain or manual refresh: always resync; if the transport
    /// is not up, reconnect now with a fresh budget.
    fn on_wake(&mut self) -> Vec<Action> {
        if self.state.is_closed() {
            return Vec::new();
        }
        let mut actions = vec![Action::ResyncAll];
        match self.state {
            ConnectionState::Reconnecting { .. } => {
                actions.push(Action::CancelReconnect);
            }
            ConnectionState::Polling => {
                actions.push(Action::StopPolling);
            }
            ConnectionState::Idle => {}
            _ => return actions,
        }
        self.budget.reset();
        self.state = ConnectionState::Connecting;
        actions.push(Action::OpenChannel);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max: u32) -> ConnectionMachine {
        ConnectionMachine::new(ReconnectBudget::new(max, 1_000, 30_000))
    }

    fn scheduled(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::ScheduleReconnect(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn test_backoff_delays_double_until_cap() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);

        let mut delays = Vec::new();
        for _ in 0..7 {
            let actions = m.handle(MachineEvent::Failed { auth: false });
            delays.push(scheduled(&actions).unwrap().as_millis() as u64);
            assert_eq!(m.handle(MachineEvent::ReconnectDue), vec![Action::OpenChannel]);
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_open_resets_backoff() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        for _ in 0..3 {
            m.handle(MachineEvent::Failed { auth: false });
            m.handle(MachineEvent::ReconnectDue);
        }
        assert_eq!(m.handle(MachineEvent::Opened), vec![Action::StartHeartbeat]);
        assert_eq!(m.budget().attempt, 0);

        let actions = m.handle(MachineEvent::Failed { auth: false });
        assert_eq!(
            actions,
            vec![
                Action::StopHeartbeat,
                Action::DropChannel,
                Action::ScheduleReconnect(Duration::from_millis(1_000))
            ]
        );
    }

    #[test]
    fn test_last_attempt_then_polling() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        m.handle(MachineEvent::Opened);
        m.budget.attempt = 9;

        let actions = m.handle(MachineEvent::Failed { auth: false });
        assert!(scheduled(&actions).is_some());
        assert_eq!(
            *m.state(),
            ConnectionState::Reconnecting {
                attempt: 10,
                delay_ms: 30_000
            }
        );

        m.handle(MachineEvent::ReconnectDue);
        let actions = m.handle(MachineEvent::Failed { auth: false });
        assert_eq!(actions, vec![Action::DropChannel, Action::StartPolling]);
        assert_eq!(*m.state(), ConnectionState::Polling);
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        let actions = m.handle(MachineEvent::Failed { auth: true });
        assert_eq!(actions, vec![Action::DropChannel, Action::ReauthRequired]);
        assert_eq!(
            *m.state(),
            ConnectionState::Closed {
                reason: CloseReason::AuthRejected
            }
        );
        assert!(m.handle(MachineEvent::Connect).is_empty());
        assert!(m.handle(MachineEvent::Foregrounded).is_empty());
        assert!(m.handle(MachineEvent::ReconnectDue).is_empty());
    }

    #[test]
    fn test_connect_is_noop_when_open_or_connecting() {
        let mut m = machine(10);
        assert_eq!(m.handle(MachineEvent::Connect), vec![Action::OpenChannel]);
        assert!(m.handle(MachineEvent::Connect).is_empty());
        m.handle(MachineEvent::Opened);
        assert!(m.handle(MachineEvent::Connect).is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        m.handle(MachineEvent::Opened);
        assert_eq!(
            m.handle(MachineEvent::Close),
            vec![Action::StopHeartbeat, Action::DropChannel]
        );
        assert_eq!(*m.state(), ConnectionState::Closing);
        m.handle(MachineEvent::Released);
        assert_eq!(
            *m.state(),
            ConnectionState::Closed {
                reason: CloseReason::Manual
            }
        );
        assert!(m.handle(MachineEvent::Close).is_empty());
        assert!(m.handle(MachineEvent::Released).is_empty());
    }

    #[test]
    fn test_close_cancels_pending_reconnect() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        m.handle(MachineEvent::Failed { auth: false });
        assert_eq!(m.handle(MachineEvent::Close), vec![Action::CancelReconnect]);
        m.handle(MachineEvent::Released);
        assert!(m.handle(MachineEvent::ReconnectDue).is_empty());
    }

    #[test]
    fn test_foreground_from_polling_reconnects_immediately() {
        let mut m = machine(1);
        m.handle(MachineEvent::Connect);
        m.handle(MachineEvent::Failed { auth: false });
        m.handle(MachineEvent::ReconnectDue);
        m.handle(MachineEvent::Failed { auth: false });
        assert!(m.polling());

        let actions = m.handle(MachineEvent::Foregrounded);
        assert_eq!(
            actions,
            vec![Action::ResyncAll, Action::StopPolling, Action::OpenChannel]
        );
        assert_eq!(m.budget().attempt, 0);
        assert_eq!(*m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_foreground_while_open_only_resyncs() {
        let mut m = machine(10);
        m.handle(MachineEvent::Connect);
        m.handle(MachineEvent::Opened);
        assert_eq!(m.handle(MachineEvent::Refresh), vec![Action::ResyncAll]);
        assert_eq!(*m.state(), ConnectionState::Open);
    }

    #[test]
    fn test_polling_and_transport_never_overlap() {
        const EVENTS: [MachineEvent; 9] = [
            MachineEvent::Connect,
            MachineEvent::Opened,
            MachineEvent::Failed { auth: false },
            MachineEvent::Failed { auth: false },
            MachineEvent::ReconnectDue,
            MachineEvent::Close,
            MachineEvent::Released,
            MachineEvent::Foregrounded,
            MachineEvent::Refresh,
        ];

        // Small LCG so the sequence is deterministic.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _run in 0..50 {
            let mut m = machine(3);
            let mut polling = false;
            for _step in 0..200 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let event = EVENTS[(seed >> 33) as usize % EVENTS.len()];
                for action in m.handle(event) {
                    match action {
                        Action::StartPolling => {
                            assert!(!polling, "polling started twice");
                            polling = true;
                        }
                        Action::StopPolling => {
                            assert!(polling, "stopped polling that was not running");
                            polling = false;
                        }
                        _ => {}
                    }
                }
                assert_eq!(polling, m.polling(), "after {:?}", event);
                assert!(!(polling && m.state().transport_driven()));
                if !m.state().is_closed() && *m.state() != ConnectionState::Idle {
                    assert!(polling ^ m.state().transport_driven());
                }
            }
        }
    }
}
