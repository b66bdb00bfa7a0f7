//! Data Access façade: the client's in-memory collections and the
//! optimistic create/update/delete discipline around them.
//!
//! This is the only writer of domain data. The router, coordinator and
//! connection driver never touch a collection directly; they call into
//! [`DataStore`].
//!
//! Optimistic rules:
//! - create: a record with a temporary id is appended at call time. On
//!   success it is replaced in place by the server's record; on failure it
//!   is removed and any optimistic side effects are reverted.
//! - update: the pre-patch record is snapshotted; on failure that exact
//!   snapshot is restored.
//! - delete: the record is removed at call time; on failure it is put back
//!   in its old position.
//! - fetch: the collection is replaced wholesale by the server's list.
//!   Requests additionally keep still-unconfirmed temporary records.
//!
//! The local change is undone when the returned future is dropped before it
//! settles, so an abandoned operation leaves nothing behind.
//!
//! Locks are never held across an `.await`.

use crate::api::{CrmApi, ListApi, MutateApi};
use crate::error::StoreError;
use crate::model::{
    Announcement, AnnouncementDraft, AnnouncementPatch, ChatChannel, ChatMessage, Entity,
    EntityId, Executor, ExecutorDraft, ExecutorPatch, GuestAccessCode, GuestCodeDraft,
    GuestCodePatch, Meeting, Mutable, RentalApartment, RentalDraft, RentalPatch, Request,
    RequestDraft, RequestPatch, Reschedule, RescheduleStatus, Vehicle, VehicleDraft, VehiclePatch,
};
use crate::stats::{self, DayBucket, ExecutorStats};
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Sync targets
// ---------------------------------------------------------------------------

/// A collection that can be refetched as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    Requests,
    Executors,
    Announcements,
    Meetings,
    Reschedules,
    ChatChannels,
    Vehicles,
    Rentals,
    GuestCodes,
}

impl SyncTarget {
    /// Targets kept live by realtime invalidation for a role.
    pub fn live_targets(role: crate::session::Role) -> Vec<SyncTarget> {
        let mut targets = vec![
            SyncTarget::Requests,
            SyncTarget::Meetings,
            SyncTarget::Announcements,
            SyncTarget::Reschedules,
            SyncTarget::ChatChannels,
        ];
        if role.sees_executors() {
            targets.push(SyncTarget::Executors);
        }
        targets
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncTarget::Requests => Request::KIND,
            SyncTarget::Executors => Executor::KIND,
            SyncTarget::Announcements => Announcement::KIND,
            SyncTarget::Meetings => Meeting::KIND,
            SyncTarget::Reschedules => Reschedule::KIND,
            SyncTarget::ChatChannels => ChatChannel::KIND,
            SyncTarget::Vehicles => Vehicle::KIND,
            SyncTarget::Rentals => RentalApartment::KIND,
            SyncTarget::GuestCodes => GuestAccessCode::KIND,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rollback guard
// ---------------------------------------------------------------------------

/// Undoes an optimistic change when dropped, unless disarmed first.
struct Rollback<'a> {
    undo: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> Rollback<'a> {
    fn new(undo: impl FnOnce() + Send + 'a) -> Self {
        Self {
            undo: Some(Box::new(undo)),
        }
    }

    fn disarm(mut self) {
        self.undo = None;
    }

    /// Undo now.
    fn run(self) {
        drop(self);
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// How many confirmed temporary ids stay resolvable.
const RECONCILED_CAPACITY: usize = 256;

struct Slots<T> {
    next_seq: u64,
    /// Display order. A replaced record keeps its sequence number.
    records: BTreeMap<u64, T>,
    index: HashMap<EntityId, u64>,
    /// Confirmed temporary id -> canonical id.
    reconciled: HashMap<EntityId, EntityId>,
    /// Temporary ids in `reconciled`, oldest first.
    reconciled_order: VecDeque<EntityId>,
}

impl<T: Entity> Slots<T> {
    fn new() -> Self {
        Self {
            next_seq: 0,
            records: BTreeMap::new(),
            index: HashMap::new(),
            reconciled: HashMap::new(),
            reconciled_order: VecDeque::new(),
        }
    }

    fn push(&mut self, record: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(record.id().clone(), seq);
        self.records.insert(seq, record);
        seq
    }

    fn resolve(&self, id: &EntityId) -> EntityId {
        self.reconciled.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn take(&mut self, id: &EntityId) -> Option<(u64, T)> {
        let seq = self.index.remove(id)?;
        let record = self.records.remove(&seq)?;
        self.forget_reconciled(id);
        Some((seq, record))
    }

    fn reconcile(&mut self, temp_id: EntityId, canonical_id: EntityId) {
        if self.reconciled.insert(temp_id.clone(), canonical_id).is_none() {
            self.reconciled_order.push_back(temp_id);
        }
        while self.reconciled_order.len() > RECONCILED_CAPACITY {
            if let Some(oldest) = self.reconciled_order.pop_front() {
                self.reconciled.remove(&oldest);
            }
        }
    }

    /// Drop mappings that point at a record no longer in the collection.
    fn forget_reconciled(&mut self, canonical_id: &EntityId) {
        if self.reconciled.is_empty() {
            return;
        }
        self.reconciled.retain(|_, canonical| canonical != canonical_id);
        let Slots {
            reconciled,
            reconciled_order,
            ..
        } = self;
        reconciled_order.retain(|temp| reconciled.contains_key(temp));
    }
}

/// One in-memory collection of entities, ordered by arrival.
pub struct Collection<T: Entity> {
    slots: RwLock<Slots<T>>,
    keep_unconfirmed: bool,
}

impl<T: Entity> Collection<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots::new()),
            keep_unconfirmed: false,
        }
    }

    /// A collection whose refetches preserve temporary records.
    pub fn keeping_unconfirmed() -> Self {
        Self {
            slots: RwLock::new(Slots::new()),
            keep_unconfirmed: true,
        }
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.slots.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a record, following a confirmed temporary id to its canonical one.
    pub fn get(&self, id: &EntityId) -> Option<T> {
        let slots = self.slots.read();
        let id = slots.resolve(id);
        let seq = slots.index.get(&id)?;
        slots.records.get(seq).cloned()
    }

    /// Canonical id for `id` if it was a confirmed temporary id.
    pub fn canonical_id(&self, id: &EntityId) -> EntityId {
        self.slots.read().resolve(id)
    }

    /// Replace the collection with the server's list.
    pub fn replace_all(&self, records: Vec<T>) {
        let mut slots = self.slots.write();
        let unconfirmed: Vec<T> = if self.keep_unconfirmed {
            slots
                .records
                .values()
                .filter(|r| r.id().is_temporary())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        slots.records.clear();
        slots.index.clear();
        for record in records {
            if let Some(seq) = slots.index.get(record.id()).copied() {
                // Duplicate id within one response: last one wins, keep position.
                slots.records.insert(seq, record);
            } else {
                slots.push(record);
            }
        }
        for record in unconfirmed {
            slots.push(record);
        }

        let Slots {
            reconciled,
            reconciled_order,
            index,
            ..
        } = &mut *slots;
        reconciled.retain(|_, canonical| index.contains_key(canonical));
        reconciled_order.retain(|temp| reconciled.contains_key(temp));
    }

    /// Insert or replace by id. Used for incremental realtime updates.
    pub fn upsert(&self, record: T) {
        let mut slots = self.slots.write();
        match slots.index.get(record.id()).copied() {
            Some(seq) => {
                slots.records.insert(seq, record);
            }
            None => {
                slots.push(record);
            }
        }
    }

    pub fn remove(&self, id: &EntityId) -> Option<T> {
        let mut slots = self.slots.write();
        let id = slots.resolve(id);
        slots.take(&id).map(|(_, record)| record)
    }

    /// Mutate a record in place, returning its previous value.
    pub fn modify(&self, id: &EntityId, f: impl FnOnce(&mut T)) -> Option<T> {
        let mut slots = self.slots.write();
        let id = slots.resolve(id);
        let seq = *slots.index.get(&id)?;
        let record = slots.records.get_mut(&seq)?;
        let before = record.clone();
        f(record);
        Some(before)
    }

    fn insert_temporary(&self, record: T) {
        self.slots.write().push(record);
    }

    /// Swap a temporary record for the server's record, in place.
    fn confirm(&self, temp_id: &EntityId, canonical: T) {
        let mut slots = self.slots.write();
        let canonical_id = canonical.id().clone();
        let temp_seq = slots.index.remove(temp_id);

        match (temp_seq, slots.index.get(&canonical_id).copied()) {
            // A refetch already brought the canonical record in; drop the temp copy.
            (Some(temp_seq), Some(existing)) => {
                slots.records.remove(&temp_seq);
                slots.records.insert(existing, canonical);
            }
            (Some(temp_seq), None) => {
                slots.index.insert(canonical_id.clone(), temp_seq);
                slots.records.insert(temp_seq, canonical);
            }
            (None, Some(existing)) => {
                slots.records.insert(existing, canonical);
            }
            // The temp record was wiped meanwhile; the server still has the entity.
            (None, None) => {
                slots.push(canonical);
            }
        }
        slots.reconcile(temp_id.clone(), canonical_id);
    }

    /// Put back a record removed by an optimistic delete, unless a refetch
    /// already restored it.
    fn reinsert(&self, seq: u64, record: T) {
        let mut slots = self.slots.write();
        if slots.index.contains_key(record.id()) {
            return;
        }
        if slots.records.contains_key(&seq) {
            slots.push(record);
        } else {
            slots.index.insert(record.id().clone(), seq);
            slots.records.insert(seq, record);
        }
    }

    /// Restore a pre-patch snapshot if the record is still present.
    fn revert(&self, snapshot: T) {
        let mut slots = self.slots.write();
        if let Some(seq) = slots.index.get(snapshot.id()).copied() {
            slots.records.insert(seq, snapshot);
        }
    }

    fn take_for_delete(&self, id: &EntityId) -> Option<(u64, T)> {
        let mut slots = self.slots.write();
        let id = slots.resolve(id);
        slots.take(&id)
    }

    /// Fetch the collection from the server and replace local contents.
    pub async fn refresh<A>(&self, api: &A) -> Result<usize, StoreError>
    where
        A: ListApi<T> + ?Sized,
    {
        let records = api.list().await?;
        let count = records.len();
        self.replace_all(records);
        debug!(kind = T::KIND, count, "collection replaced");
        Ok(count)
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Mutable> Collection<T> {
    /// Optimistic create. The temporary record is visible as soon as this
    /// function returns, before the returned future is polled, and is
    /// removed again if the future fails or is dropped unfinished.
    pub fn create<'a, A>(
        &'a self,
        api: &'a A,
        draft: T::Draft,
    ) -> impl Future<Output = Result<T, StoreError>> + Send + 'a
    where
        A: MutateApi<T> + ?Sized,
    {
        let temp_id = EntityId::temporary();
        self.insert_temporary(T::materialize(temp_id.clone(), &draft));
        let rollback = {
            let temp_id = temp_id.clone();
            Rollback::new(move || {
                if self.remove(&temp_id).is_some() {
                    debug!(kind = T::KIND, temp = %temp_id, "temporary record removed");
                }
            })
        };

        async move {
            match api.create(&draft).await {
                Ok(canonical) => {
                    rollback.disarm();
                    debug!(kind = T::KIND, temp = %temp_id, id = %canonical.id(), "create confirmed");
                    self.confirm(&temp_id, canonical.clone());
                    Ok(canonical)
                }
                Err(e) => {
                    warn!(kind = T::KIND, temp = %temp_id, error = %e, "create failed, rolling back");
                    rollback.run();
                    Err(e.into())
                }
            }
        }
    }

    /// Optimistic update with exact snapshot restore on failure.
    pub fn update<'a, A>(
        &'a self,
        api: &'a A,
        id: &EntityId,
        patch: T::Patch,
    ) -> impl Future<Output = Result<T, StoreError>> + Send + 'a
    where
        A: MutateApi<T> + ?Sized,
    {
        let id = self.canonical_id(id);
        let rollback = if id.is_temporary() {
            Err(StoreError::Unconfirmed(id.to_string()))
        } else {
            self.modify(&id, |record| record.apply_patch(&patch))
                .map(move |before| Rollback::new(move || self.revert(before)))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        };

        async move {
            let rollback = rollback?;
            match api.update(&id, &patch).await {
                Ok(canonical) => {
                    rollback.disarm();
                    self.upsert(canonical.clone());
                    Ok(canonical)
                }
                Err(e) => {
                    warn!(kind = T::KIND, %id, error = %e, "update failed, restoring snapshot");
                    rollback.run();
                    Err(e.into())
                }
            }
        }
    }

    /// Optimistic delete; the record is put back if the server refuses or
    /// the future is dropped unfinished.
    pub fn delete<'a, A>(
        &'a self,
        api: &'a A,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a
    where
        A: MutateApi<T> + ?Sized,
    {
        let id = self.canonical_id(id);
        let rollback = if id.is_temporary() {
            Err(StoreError::Unconfirmed(id.to_string()))
        } else {
            self.take_for_delete(&id)
                .map(move |(seq, record)| Rollback::new(move || self.reinsert(seq, record)))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        };

        async move {
            let rollback = rollback?;
            match api.delete(&id).await {
                Ok(()) => {
                    rollback.disarm();
                    Ok(())
                }
                Err(e) => {
                    warn!(kind = T::KIND, %id, error = %e, "delete failed, reinserting");
                    rollback.run();
                    Err(e.into())
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

/// Per-session façade over every domain collection.
pub struct DataStore {
    api: Arc<dyn CrmApi>,
    pub requests: Collection<Request>,
    pub executors: Collection<Executor>,
    pub vehicles: Collection<Vehicle>,
    pub rentals: Collection<RentalApartment>,
    pub guest_codes: Collection<GuestAccessCode>,
    pub announcements: Collection<Announcement>,
    pub meetings: Collection<Meeting>,
    pub reschedules: Collection<Reschedule>,
    pub chat_channels: Collection<ChatChannel>,
}

impl DataStore {
    pub fn new(api: Arc<dyn CrmApi>) -> Self {
        Self {
            api,
            requests: Collection::keeping_unconfirmed(),
            executors: Collection::new(),
            vehicles: Collection::new(),
            rentals: Collection::new(),
            guest_codes: Collection::new(),
            announcements: Collection::new(),
            meetings: Collection::new(),
            reschedules: Collection::new(),
            chat_channels: Collection::new(),
        }
    }

    /// Refetch one collection. Returns the number of records received.
    pub async fn fetch(&self, target: SyncTarget) -> Result<usize, StoreError> {
        let api = &*self.api;
        match target {
            SyncTarget::Requests => self.requests.refresh(api).await,
            SyncTarget::Executors => self.executors.refresh(api).await,
            SyncTarget::Announcements => self.announcements.refresh(api).await,
            SyncTarget::Meetings => self.meetings.refresh(api).await,
            SyncTarget::Reschedules => self.reschedules.refresh(api).await,
            SyncTarget::ChatChannels => self.chat_channels.refresh(api).await,
            SyncTarget::Vehicles => self.vehicles.refresh(api).await,
            SyncTarget::Rentals => self.rentals.refresh(api).await,
            SyncTarget::GuestCodes => self.guest_codes.refresh(api).await,
        }
    }

    // -- Requests ----------------------------------------------------------

    /// Create a request. An assigned executor's load counter is bumped
    /// optimistically and reverted if the server refuses. A refetch that
    /// lands meanwhile overwrites the bump, in which case there is nothing
    /// left to revert.
    pub fn create_request(
        &self,
        draft: RequestDraft,
    ) -> impl Future<Output = Result<Request, StoreError>> + Send + '_ {
        let rollback = draft.executor_id.clone().and_then(move |executor_id| {
            let before = self
                .executors
                .modify(&executor_id, |e| e.active_requests += 1)?;
            let bumped = before.active_requests + 1;
            Some(Rollback::new(move || {
                self.executors.modify(&executor_id, |e| {
                    if e.active_requests == bumped {
                        e.active_requests -= 1;
                    }
                });
            }))
        });
        let pending = self.requests.create(&*self.api, draft);

        async move {
            let result = pending.await;
            if let Some(rollback) = rollback {
                match &result {
                    Ok(_) => rollback.disarm(),
                    Err(_) => rollback.run(),
                }
            }
            result
        }
    }

    pub fn update_request<'a>(
        &'a self,
        id: &EntityId,
        patch: RequestPatch,
    ) -> impl Future<Output = Result<Request, StoreError>> + Send + 'a {
        self.requests.update(&*self.api, id, patch)
    }

    pub fn delete_request<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.requests.delete(&*self.api, id)
    }

    // -- Executors ---------------------------------------------------------

    pub fn create_executor(
        &self,
        draft: ExecutorDraft,
    ) -> impl Future<Output = Result<Executor, StoreError>> + Send + '_ {
        self.executors.create(&*self.api, draft)
    }

    pub fn update_executor<'a>(
        &'a self,
        id: &EntityId,
        patch: ExecutorPatch,
    ) -> impl Future<Output = Result<Executor, StoreError>> + Send + 'a {
        self.executors.update(&*self.api, id, patch)
    }

    pub fn delete_executor<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.executors.delete(&*self.api, id)
    }

    // -- Vehicles ----------------------------------------------------------

    pub fn create_vehicle(
        &self,
        draft: VehicleDraft,
    ) -> impl Future<Output = Result<Vehicle, StoreError>> + Send + '_ {
        self.vehicles.create(&*self.api, draft)
    }

    pub fn update_vehicle<'a>(
        &'a self,
        id: &EntityId,
        patch: VehiclePatch,
    ) -> impl Future<Output = Result<Vehicle, StoreError>> + Send + 'a {
        self.vehicles.update(&*self.api, id, patch)
    }

    pub fn delete_vehicle<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.vehicles.delete(&*self.api, id)
    }

    // -- Rentals -----------------------------------------------------------

    pub fn create_rental(
        &self,
        draft: RentalDraft,
    ) -> impl Future<Output = Result<RentalApartment, StoreError>> + Send + '_ {
        self.rentals.create(&*self.api, draft)
    }

    pub fn update_rental<'a>(
        &'a self,
        id: &EntityId,
        patch: RentalPatch,
    ) -> impl Future<Output = Result<RentalApartment, StoreError>> + Send + 'a {
        self.rentals.update(&*self.api, id, patch)
    }

    pub fn delete_rental<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.rentals.delete(&*self.api, id)
    }

    // -- Guest access codes ------------------------------------------------

    pub fn create_guest_code(
        &self,
        draft: GuestCodeDraft,
    ) -> impl Future<Output = Result<GuestAccessCode, StoreError>> + Send + '_ {
        self.guest_codes.create(&*self.api, draft)
    }

    pub fn update_guest_code<'a>(
        &'a self,
        id: &EntityId,
        patch: GuestCodePatch,
    ) -> impl Future<Output = Result<GuestAccessCode, StoreError>> + Send + 'a {
        self.guest_codes.update(&*self.api, id, patch)
    }

    pub fn delete_guest_code<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.guest_codes.delete(&*self.api, id)
    }

    // -- Announcements -----------------------------------------------------

    pub fn create_announcement(
        &self,
        draft: AnnouncementDraft,
    ) -> impl Future<Output = Result<Announcement, StoreError>> + Send + '_ {
        self.announcements.create(&*self.api, draft)
    }

    pub fn update_announcement<'a>(
        &'a self,
        id: &EntityId,
        patch: AnnouncementPatch,
    ) -> impl Future<Output = Result<Announcement, StoreError>> + Send + 'a {
        self.announcements.update(&*self.api, id, patch)
    }

    pub fn delete_announcement<'a>(
        &'a self,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        self.announcements.delete(&*self.api, id)
    }

    // -- Incremental realtime updates ---------------------------------------

    /// Apply a reschedule proposal pushed over the realtime channel. The
    /// collection holds pending proposals only, so resolved ones leave it.
    pub fn apply_reschedule(&self, reschedule: Reschedule) {
        match reschedule.status {
            RescheduleStatus::Pending => {
                debug!(id = %reschedule.id, "reschedule proposal upserted");
                self.reschedules.upsert(reschedule);
            }
            RescheduleStatus::Accepted | RescheduleStatus::Rejected => {
                if self.reschedules.remove(&reschedule.id).is_some() {
                    info!(id = %reschedule.id, status = ?reschedule.status, "reschedule resolved");
                }
            }
        }
    }

    /// Record a chat message on its channel summary. Returns `false` when
    /// the channel already shows this message as its latest, in which case
    /// nothing changes.
    pub fn apply_chat_message(&self, message: &ChatMessage, unread: bool) -> bool {
        let mut fresh = true;
        let updated = self.chat_channels.modify(&message.channel_id, |channel| {
            if channel.last_message.as_ref().map(|m| &m.id) == Some(&message.id) {
                fresh = false;
                return;
            }
            channel.last_message = Some(message.clone());
            if unread {
                channel.unread_count += 1;
            }
        });
        if updated.is_none() {
            debug!(channel = %message.channel_id, "chat message for unknown channel");
        }
        fresh
    }

    /// Clear the unread counter of a channel the current user has read.
    pub fn mark_channel_read(&self, channel_id: &EntityId) {
        self.chat_channels
            .modify(channel_id, |channel| channel.unread_count = 0);
    }

    // -- Derived views -------------------------------------------------------

    pub fn executor_stats(&self) -> Vec<ExecutorStats> {
        stats::executor_stats(&self.executors.snapshot(), &self.requests.snapshot())
    }

    pub fn weekly_chart(&self, today: NaiveDate) -> Vec<DayBucket> {
        stats::weekly_buckets(&self.requests.snapshot(), today)
    }
}
