//! In-process doubles for the REST collaborator, the realtime channel and
//! the notification sink. Test builds only.

use crate::api::{ListApi, MutateApi};
use crate::error::{ApiError, TransportError};
use crate::model::{Entity, EntityId, Executor, Mutable, Request, RequestStatus};
use crate::notify::{Notification, Notifier};
use crate::store::SyncTarget;
use crate::transport::{Channel, Connector, Frame};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub fn request(id: &str, title: &str) -> Request {
    Request {
        id: EntityId::from(id),
        title: title.to_string(),
        description: String::new(),
        category: None,
        status: RequestStatus::New,
        resident_id: None,
        executor_id: None,
        apartment: None,
        created_at: Utc::now(),
        completed_at: None,
        rating: None,
    }
}

pub fn executor(id: &str, name: &str, active_requests: u32) -> Executor {
    Executor {
        id: EntityId::from(id),
        name: name.to_string(),
        specialization: None,
        phone: None,
        active_requests,
        available: true,
    }
}

// ---------------------------------------------------------------------------
// MockApi
// ---------------------------------------------------------------------------

/// Scriptable REST collaborator. Collections are held as JSON values keyed
/// by entity kind so one instance serves every entity type.
#[derive(Default)]
pub struct MockApi {
    lists: Mutex<HashMap<&'static str, Vec<Value>>>,
    list_calls: Mutex<HashMap<&'static str, usize>>,
    failing_lists: Mutex<HashSet<&'static str>>,
    failing_mutations: Mutex<HashSet<&'static str>>,
    latency: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_list<T: Entity>(&self, records: Vec<T>) {
        let values = records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect();
        self.lists.lock().insert(T::KIND, values);
    }

    pub fn fail_lists<T: Entity>(&self, fail: bool) {
        let mut set = self.failing_lists.lock();
        if fail {
            set.insert(T::KIND);
        } else {
            set.remove(T::KIND);
        }
    }

    pub fn fail_mutations<T: Entity>(&self, fail: bool) {
        let mut set = self.failing_mutations.lock();
        if fail {
            set.insert(T::KIND);
        } else {
            set.remove(T::KIND);
        }
    }

    /// Delay applied to every list call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn list_calls(&self, target: SyncTarget) -> usize {
        self.list_calls
            .lock()
            .get(target.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_list_calls(&self) -> usize {
        self.list_calls.lock().values().sum()
    }

    /// Highest number of list calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn mutation_gate(&self, kind: &'static str) -> Result<(), ApiError> {
        if self.failing_mutations.lock().contains(kind) {
            return Err(ApiError::Status {
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Entity> ListApi<T> for MockApi {
    async fn list(&self) -> Result<Vec<T>, ApiError> {
        *self.list_calls.lock().entry(T::KIND).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_lists.lock().contains(T::KIND) {
            return Err(ApiError::Network("injected failure".to_string()));
        }
        let values = self.lists.lock().get(T::KIND).cloned().unwrap_or_default();
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| ApiError::Decode(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl<T: Mutable> MutateApi<T> for MockApi {
    async fn create(&self, draft: &T::Draft) -> Result<T, ApiError> {
        tokio::task::yield_now().await;
        self.mutation_gate(T::KIND)?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = T::materialize(EntityId::from(format!("srv-{}", n)), draft);
        let value = serde_json::to_value(&record).map_err(|e| ApiError::Decode(e.to_string()))?;
        self.lists.lock().entry(T::KIND).or_default().push(value);
        Ok(record)
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, ApiError> {
        tokio::task::yield_now().await;
        self.mutation_gate(T::KIND)?;
        let mut lists = self.lists.lock();
        let values = lists.entry(T::KIND).or_default();
        for value in values.iter_mut() {
            let mut record: T =
                serde_json::from_value(value.clone()).map_err(|e| ApiError::Decode(e.to_string()))?;
            if record.id() == id {
                record.apply_patch(patch);
                *value =
                    serde_json::to_value(&record).map_err(|e| ApiError::Decode(e.to_string()))?;
                return Ok(record);
            }
        }
        Err(ApiError::Status {
            status: 404,
            body: format!("{} not found", id),
        })
    }

    async fn delete(&self, id: &EntityId) -> Result<(), ApiError> {
        tokio::task::yield_now().await;
        self.mutation_gate(T::KIND)?;
        let mut lists = self.lists.lock();
        let values = lists.entry(T::KIND).or_default();
        values.retain(|v| {
            serde_json::from_value::<T>(v.clone())
                .map(|r| r.id() != id)
                .unwrap_or(true)
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedConnector
// ---------------------------------------------------------------------------

enum Script {
    Accept(ScriptedChannel),
    Unauthorized,
}

/// A `Connector` whose outcomes are queued by the test. An empty script
/// refuses the connection like an unreachable server.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
    urls: Mutex<Vec<Url>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful open; the returned handle plays the server.
    pub fn push_accept(&self) -> ServerSide {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.script
            .lock()
            .push_back(Script::Accept(ScriptedChannel { inbound, outbound }));
        ServerSide {
            to_client,
            from_client,
        }
    }

    pub fn push_unauthorized(&self) {
        self.script.lock().push_back(Script::Unauthorized);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(Script::Accept(channel)) => Ok(Box::new(channel)),
            Some(Script::Unauthorized) => {
                Err(TransportError::Unauthorized("HTTP 401".to_string()))
            }
            None => Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            )),
        }
    }
}

pub struct ScriptedChannel {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Closed {
                code: None,
                reason: "peer gone".to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inbound.close();
        Ok(())
    }
}

/// Server end of a scripted channel. Dropping it ends the client's stream.
pub struct ServerSide {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerSide {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Frame::Text(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Frame::Close {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Frames the client has sent so far.
    pub fn sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(text);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
