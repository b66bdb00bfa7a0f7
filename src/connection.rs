//! Transport Connection and Fallback Controller.
//!
//! A single driver task per session owns the realtime channel and every
//! timer around it (reconnect backoff, heartbeat, optional pong deadline,
//! fallback polling). It feeds transport events and commands into the
//! [`ConnectionMachine`] and executes the actions it returns, so the state
//! only changes in response to transport events and timers.
//!
//! Callers talk to the task through a [`ConnectionHandle`] and observe the
//! state through a `watch` channel.

use crate::config::RealtimeConfig;
use crate::coordinator::SyncCoordinator;
use crate::envelope;
use crate::error::TransportError;
use crate::machine::{Action, ConnectionMachine, ConnectionState, MachineEvent, ReconnectBudget};
use crate::router::MessageRouter;
use crate::session::SessionContext;
use crate::transport::{is_auth_close, Channel, Connector, Frame};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Escalations for the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// The server rejected the token; the user must sign in again.
    ReauthRequired,
}

enum Command {
    Connect,
    Close(oneshot::Sender<()>),
    Visible(bool),
    Refresh,
}

/// Everything the driver needs besides its command channel.
pub struct ConnectionParts {
    pub config: RealtimeConfig,
    pub session: Arc<SessionContext>,
    pub connector: Arc<dyn Connector>,
    pub router: Arc<MessageRouter>,
    pub coordinator: Arc<SyncCoordinator>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    /// Start the driver task. The connection stays `Idle` until `connect`.
    pub fn spawn(parts: ConnectionParts) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine: ConnectionMachine::new(ReconnectBudget::from_config(&parts.config)),
            parts,
            state_tx,
            signal_tx,
        };
        let task = tokio::spawn(driver.run(cmd_rx));

        (
            Self {
                cmd_tx,
                state_rx,
                task: Mutex::new(Some(task)),
            },
            signal_rx,
        )
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the channel and wait until the driver has released it.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Report UI visibility. Going to the background never tears down the
    /// channel; coming back resyncs and reconnects if needed.
    pub fn set_visible(&self, visible: bool) {
        self.send(Command::Visible(visible));
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Close and wait for the driver task to exit.
    pub async fn shutdown(&self) {
        self.close().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("connection driver already stopped");
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Opening = BoxFuture<'static, Result<Box<dyn Channel>, TransportError>>;

/// Loop-local resources; each is `None` while inactive.
#[derive(Default)]
struct Io {
    channel: Option<Box<dyn Channel>>,
    opening: Option<Opening>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    pong_deadline: Option<Instant>,
    poll: Option<Interval>,
}

struct Driver {
    parts: ConnectionParts,
    machine: ConnectionMachine,
    state_tx: watch::Sender<ConnectionState>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
}

async fn next_frame(channel: &mut Option<Box<dyn Channel>>) -> Option<Result<Frame, TransportError>> {
    match channel {
        Some(channel) => channel.recv().await,
        None => pending().await,
    }
}

async fn opened(opening: &mut Option<Opening>) -> Result<Box<dyn Channel>, TransportError> {
    match opening {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut io = Io::default();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => self.apply(MachineEvent::Connect, &mut io).await,
                    Some(Command::Close(ack)) => {
                        self.close(&mut io).await;
                        let _ = ack.send(());
                    }
                    Some(Command::Visible(true)) => {
                        self.apply(MachineEvent::Foregrounded, &mut io).await
                    }
                    Some(Command::Visible(false)) => {
                        debug!("backgrounded, keeping channel");
                    }
                    Some(Command::Refresh) => self.apply(MachineEvent::Refresh, &mut io).await,
                    None => {
                        self.close(&mut io).await;
                        break;
                    }
                },

                result = opened(&mut io.opening) => {
                    io.opening = None;
                    match result {
                        Ok(channel) => {
                            io.channel = Some(channel);
                            self.apply(MachineEvent::Opened, &mut io).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "realtime channel failed to open");
                            self.apply(MachineEvent::Failed { auth: e.is_auth() }, &mut io).await;
                        }
                    }
                }

                frame = next_frame(&mut io.channel) => {
                    io.pong_deadline = None;
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            self.parts.router.route_frame(&text);
                        }
                        Some(Ok(Frame::Close { code, reason })) => {
                            let auth = is_auth_close(code);
                            info!(?code, %reason, "realtime channel closed by server");
                            io.channel = None;
                            self.apply(MachineEvent::Failed { auth }, &mut io).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "realtime channel error");
                            io.channel = None;
                            self.apply(MachineEvent::Failed { auth: e.is_auth() }, &mut io).await;
                        }
                        None => {
                            info!("realtime channel ended");
                            io.channel = None;
                            self.apply(MachineEvent::Failed { auth: false }, &mut io).await;
                        }
                    }
                }

                _ = deadline(io.reconnect_at) => {
                    io.reconnect_at = None;
                    self.apply(MachineEvent::ReconnectDue, &mut io).await;
                }

                _ = tick(&mut io.heartbeat) => self.heartbeat(&mut io).await,

                _ = deadline(io.pong_deadline) => {
                    warn!("no frame received after ping, treating channel as dead");
                    io.pong_deadline = None;
                    self.apply(MachineEvent::Failed { auth: false }, &mut io).await;
                }

                _ = tick(&mut io.poll) => {
                    debug!("poll tick");
                    self.parts.coordinator.spawn_sync_all();
                }
            }
        }

        debug!("connection driver stopped");
    }

    async fn close(&mut self, io: &mut Io) {
        self.apply(MachineEvent::Close, io).await;
        self.apply(MachineEvent::Released, io).await;
    }

    async fn heartbeat(&mut self, io: &mut Io) {
        let Some(channel) = io.channel.as_mut() else {
            return;
        };
        if let Err(e) = channel.send(envelope::ping_frame()).await {
            warn!(error = %e, "heartbeat failed");
            io.channel = None;
            self.apply(MachineEvent::Failed { auth: false }, io).await;
            return;
        }
        if io.pong_deadline.is_none() {
            io.pong_deadline = self.parts.config.pong_timeout().map(|t| Instant::now() + t);
        }
    }

    /// Feed one event to the machine, then carry out its actions.
    async fn apply(&mut self, event: MachineEvent, io: &mut Io) {
        let actions = self.machine.handle(event);
        for action in actions {
            self.execute(action, io).await;
        }
        let state = self.machine.state().clone();
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    async fn execute(&mut self, action: Action, io: &mut Io) {
        match action {
            Action::OpenChannel => {
                let connector = Arc::clone(&self.parts.connector);
                let url = self.parts.config.channel_url(&self.parts.session.token);
                io.opening = Some(Box::pin(async move { connector.open(&url?).await }));
            }
            Action::DropChannel => {
                io.opening = None;
                io.pong_deadline = None;
                if let Some(mut channel) = io.channel.take() {
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "error while closing channel");
                    }
                }
            }
            Action::StartHeartbeat => {
                let supports_send = io.channel.as_ref().map(|c| c.supports_send()).unwrap_or(false);
                if supports_send {
                    let period = self.parts.config.heartbeat_interval();
                    io.heartbeat = Some(interval_at(Instant::now() + period, period));
                }
            }
            Action::StopHeartbeat => {
                io.heartbeat = None;
                io.pong_deadline = None;
            }
            Action::ScheduleReconnect(delay) => {
                info!(
                    attempt = self.machine.budget().attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                io.reconnect_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => io.reconnect_at = None,
            Action::StartPolling => {
                let mut timer = interval(self.parts.config.poll_interval());
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                io.poll = Some(timer);
                info!(
                    interval_ms = self.parts.config.poll_interval_ms,
                    "fallback polling started"
                );
            }
            Action::StopPolling => {
                if io.poll.take().is_some() {
                    info!("fallback polling stopped");
                }
            }
            Action::ResyncAll => self.parts.coordinator.spawn_sync_all(),
            Action::ReauthRequired => {
                error!(user = %self.parts.session.user_id, "realtime token rejected, re-authentication required");
                let _ = self.signal_tx.send(SessionSignal::ReauthRequired);
            }
        }
    }
}
