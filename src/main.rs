//! facility-watch - follow a CRM session's realtime feed from a terminal.
//!
//! Usage:
//!   FACILITY_TOKEN=... FACILITY_ROLE=manager facility-watch
//!
//! Environment:
//!   FACILITY_TOKEN  - session token (required)
//!   FACILITY_USER   - user id of the token's owner (default: "watch")
//!   FACILITY_ROLE   - resident | executor | manager | admin | dispatcher | department_head
//!                     (default: manager)
//!   RUST_LOG        - log filter (default: info)
//!
//! All `FACILITY_*` transport settings from `RealtimeConfig::from_env` apply.

use anyhow::{Context, Result};
use facility_realtime::{
    transport, ChatEvent, HttpApi, RealtimeConfig, RealtimeSession, Role, SessionContext,
    SessionSignal, TracingNotifier,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = RealtimeConfig::from_env();
    let token = std::env::var("FACILITY_TOKEN").context("FACILITY_TOKEN is not set")?;
    let user_id = std::env::var("FACILITY_USER").unwrap_or_else(|_| "watch".to_string());
    let role: Role = std::env::var("FACILITY_ROLE")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(Role::Manager);

    let session = SessionContext::new(token, user_id, role);
    let api = HttpApi::new(&config.base_url, Arc::new(session.clone()))?;
    let connector = transport::connector_for(&config)?;

    let mut realtime = RealtimeSession::start(
        config,
        session,
        Arc::new(api),
        connector,
        Arc::new(TracingNotifier),
    );

    let _chat = realtime.bus().chat.subscribe(|event: &ChatEvent| match event {
        ChatEvent::Message(m) => info!(channel = %m.channel_id, from = %m.sender_id, "chat: {}", m.content),
        ChatEvent::Read(r) => info!(channel = %r.channel_id, by = %r.user_id, "chat read"),
    });
    let _reschedules = realtime.bus().reschedule.subscribe(|r| {
        info!(id = %r.id, request = %r.request_id, status = ?r.status, "reschedule");
    });

    let mut state = realtime.watch_state();
    info!(state = %realtime.state(), "watching");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                info!(state = %current, "connection");
            }
            signal = realtime.next_signal() => match signal {
                Some(SessionSignal::ReauthRequired) => {
                    error!("token rejected by server; sign in again and restart");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    let requests = realtime.store().requests.len();
    info!(requests, "shutting down");
    realtime.shutdown().await;
    Ok(())
}
