//! Sync Coordinator: turns invalidation signals into refetches.
//!
//! - `signal(target)` arms a debounce timer for the target unless one is
//!   already pending; later signals inside the window coalesce into it.
//!   The pending timer is not pushed back, so a steady stream of signals
//!   still refetches at least once per window.
//! - At most one fetch per target is outstanding. A timer that expires
//!   while a fetch is running marks the target for one more pass when the
//!   running fetch finishes.
//! - Different targets fetch in parallel.
//! - Fetch errors are logged and swallowed; the next signal or poll tick
//!   retries.

use crate::session::Role;
use crate::store::{DataStore, SyncTarget};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What `signal` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A new debounce window was armed.
    Scheduled,
    /// Folded into an already pending window.
    Coalesced,
    /// Not relevant for this session's role, or the coordinator is closed.
    Skipped,
}

#[derive(Debug, Default)]
struct Slot {
    pending: bool,
    in_flight: bool,
    rerun: bool,
}

pub struct SyncCoordinator {
    store: Arc<DataStore>,
    role: Role,
    debounce: Duration,
    slots: Mutex<HashMap<SyncTarget, Slot>>,
    closed: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(store: Arc<DataStore>, role: Role, debounce: Duration) -> Self {
        Self {
            store,
            role,
            debounce,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether this session refetches `target` at all.
    pub fn is_relevant(&self, target: SyncTarget) -> bool {
        match target {
            SyncTarget::Executors => self.role.sees_executors(),
            _ => true,
        }
    }

    /// Targets refreshed by a full resync.
    pub fn targets(&self) -> Vec<SyncTarget> {
        SyncTarget::live_targets(self.role)
    }

    /// Record an invalidation for `target`. Must be called within a tokio
    /// runtime.
    pub fn signal(self: &Arc<Self>, target: SyncTarget) -> Signal {
        if self.closed.load(Ordering::Acquire) || !self.is_relevant(target) {
            trace!(%target, role = %self.role, "signal skipped");
            return Signal::Skipped;
        }

        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(target).or_default();
            if slot.pending {
                trace!(%target, "signal coalesced");
                return Signal::Coalesced;
            }
            slot.pending = true;
        }

        let this = Arc::clone(self);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(slot) = this.slots.lock().get_mut(&target) {
                slot.pending = false;
            }
            if !this.closed.load(Ordering::Acquire) {
                this.run(target).await;
            }
        });
        debug!(%target, debounce_ms = debounce.as_millis() as u64, "refetch scheduled");
        Signal::Scheduled
    }

    /// Refetch `target` now, respecting the one-in-flight rule. Returns once
    /// this call's fetch (and any rerun it owns) is done, or immediately if
    /// another fetch already owns the target.
    pub async fn run(&self, target: SyncTarget) {
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(target).or_default();
            if slot.in_flight {
                slot.rerun = true;
                trace!(%target, "fetch in flight, rerun queued");
                return;
            }
            slot.in_flight = true;
        }

        loop {
            match self.store.fetch(target).await {
                Ok(count) => debug!(%target, count, "refetched"),
                Err(e) => warn!(%target, error = %e, "refetch failed"),
            }

            let again = {
                let mut slots = self.slots.lock();
                let slot = slots.entry(target).or_default();
                if slot.rerun {
                    slot.rerun = false;
                    true
                } else {
                    slot.in_flight = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    /// Refetch every target relevant to this role, in parallel.
    pub async fn sync_all(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let targets = self.targets();
        debug!(targets = targets.len(), "full resync");
        join_all(targets.into_iter().map(|t| self.run(t))).await;
    }

    pub fn spawn_sync_all(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.sync_all().await });
    }

    /// Stop accepting signals. Pending windows expire without fetching.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Request;
    use crate::test_support::{request, MockApi};
    use tokio::time::{sleep, Instant};

    fn coordinator(api: &Arc<MockApi>, role: Role) -> Arc<SyncCoordinator> {
        let store = Arc::new(DataStore::new(api.clone()));
        Arc::new(SyncCoordinator::new(
            store,
            role,
            Duration::from_millis(500),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_fetch() {
        let api = Arc::new(MockApi::new());
        let coord = coordinator(&api, Role::Manager);

        assert_eq!(coord.signal(SyncTarget::Requests), Signal::Scheduled);
        sleep(Duration::from_millis(80)).await;
        assert_eq!(coord.signal(SyncTarget::Requests), Signal::Coalesced);
        sleep(Duration::from_millis(80)).await;
        assert_eq!(coord.signal(SyncTarget::Requests), Signal::Coalesced);

        // 160ms elapsed; nothing before the 500ms mark.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_signals_each_fetch() {
        let api = Arc::new(MockApi::new());
        let coord = coordinator(&api, Role::Resident);

        for _ in 0..3 {
            assert_eq!(coord.signal(SyncTarget::Meetings), Signal::Scheduled);
            sleep(Duration::from_millis(700)).await;
        }
        assert_eq!(api.list_calls(SyncTarget::Meetings), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_fetch_in_flight_per_target() {
        let api = Arc::new(MockApi::new());
        api.set_latency(Duration::from_secs(1));
        let coord = coordinator(&api, Role::Manager);

        coord.signal(SyncTarget::Requests);
        // Fetch starts at 500ms and runs until 1500ms.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(coord.signal(SyncTarget::Requests), Signal::Scheduled);
        // Second window expires at 1100ms while the first fetch is running.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 1);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 2);
        assert_eq!(api.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_refresh_is_role_gated() {
        let api = Arc::new(MockApi::new());
        let resident = coordinator(&api, Role::Resident);
        assert_eq!(resident.signal(SyncTarget::Executors), Signal::Skipped);
        resident.sync_all().await;
        assert_eq!(api.list_calls(SyncTarget::Executors), 0);

        let dispatcher = coordinator(&api, Role::Dispatcher);
        assert_eq!(dispatcher.signal(SyncTarget::Executors), Signal::Scheduled);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(api.list_calls(SyncTarget::Executors), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_are_swallowed() {
        let api = Arc::new(MockApi::new());
        api.fail_lists::<Request>(true);
        let coord = coordinator(&api, Role::Manager);

        coord.run(SyncTarget::Requests).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 1);

        api.fail_lists::<Request>(false);
        api.set_list(vec![request("1", "Leak")]);
        coord.signal(SyncTarget::Requests);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(api.list_calls(SyncTarget::Requests), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_all_runs_targets_in_parallel() {
        let api = Arc::new(MockApi::new());
        api.set_latency(Duration::from_secs(1));
        let coord = coordinator(&api, Role::Manager);

        let started = Instant::now();
        coord.sync_all().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(api.total_list_calls(), coord.targets().len());
        assert!(api.max_in_flight() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_coordinator_ignores_signals() {
        let api = Arc::new(MockApi::new());
        let coord = coordinator(&api, Role::Manager);
        coord.signal(SyncTarget::Requests);
        coord.close();
        assert_eq!(coord.signal(SyncTarget::Meetings), Signal::Skipped);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(api.total_list_calls(), 0);
    }
}
