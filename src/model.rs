//! Domain entities held by the client-side store.
//!
//! Every collection element implements [`Entity`]. Entities the client can
//! create, edit and delete also implement [`Mutable`], which describes how
//! an optimistic record is materialized from a draft before the server has
//! answered and how a patch is applied locally.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix marking ids minted locally for unconfirmed records.
pub const TEMP_ID_PREFIX: &str = "temp-";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Record identifier. Servers send numbers or strings; both normalize to text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh local id for an optimistic record.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => EntityId(s),
            Raw::Int(n) => EntityId(n.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Entity traits
// ---------------------------------------------------------------------------

/// A record in one of the client's in-memory collections.
pub trait Entity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection name used in logs and by test doubles.
    const KIND: &'static str;
    /// REST resource path, e.g. `/api/requests`.
    const PATH: &'static str;
    /// Path that lists the collection, when it differs from `PATH`.
    const LIST_PATH: &'static str = Self::PATH;

    fn id(&self) -> &EntityId;
}

/// An entity the client creates and edits optimistically.
pub trait Mutable: Entity {
    type Draft: Clone + fmt::Debug + Serialize + Send + Sync + 'static;
    type Patch: Clone + fmt::Debug + Serialize + Send + Sync + 'static;

    /// Best-known record for `draft`, shown before the server confirms it.
    fn materialize(id: EntityId, draft: &Self::Draft) -> Self;

    fn apply_patch(&mut self, patch: &Self::Patch);
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

/// A maintenance request filed by a resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestDraft {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
}

impl Entity for Request {
    const KIND: &'static str = "requests";
    const PATH: &'static str = "/api/requests";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for Request {
    type Draft = RequestDraft;
    type Patch = RequestPatch;

    fn materialize(id: EntityId, draft: &RequestDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            category: draft.category.clone(),
            status: if draft.executor_id.is_some() {
                RequestStatus::Assigned
            } else {
                RequestStatus::New
            },
            resident_id: None,
            executor_id: draft.executor_id.clone(),
            apartment: draft.apartment.clone(),
            created_at: Utc::now(),
            completed_at: None,
            rating: None,
        }
    }

    fn apply_patch(&mut self, patch: &RequestPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
            if status == RequestStatus::Completed && self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        }
        if let Some(executor_id) = &patch.executor_id {
            self.executor_id = Some(executor_id.clone());
        }
        if let Some(rating) = patch.rating {
            self.rating = Some(rating);
        }
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Maintenance staff member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Open requests currently assigned. Bumped optimistically on assignment.
    #[serde(default)]
    pub active_requests: u32,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorDraft {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

impl Entity for Executor {
    const KIND: &'static str = "executors";
    const PATH: &'static str = "/api/executors";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for Executor {
    type Draft = ExecutorDraft;
    type Patch = ExecutorPatch;

    fn materialize(id: EntityId, draft: &ExecutorDraft) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            specialization: draft.specialization.clone(),
            phone: draft.phone.clone(),
            active_requests: 0,
            available: true,
        }
    }

    fn apply_patch(&mut self, patch: &ExecutorPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(spec) = &patch.specialization {
            self.specialization = Some(spec.clone());
        }
        if let Some(phone) = &patch.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(available) = patch.available {
            self.available = available;
        }
    }
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: EntityId,
    pub plate_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parking_spot: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleDraft {
    pub plate_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parking_spot: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VehiclePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parking_spot: Option<String>,
}

impl Entity for Vehicle {
    const KIND: &'static str = "vehicles";
    const PATH: &'static str = "/api/vehicles";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for Vehicle {
    type Draft = VehicleDraft;
    type Patch = VehiclePatch;

    fn materialize(id: EntityId, draft: &VehicleDraft) -> Self {
        Self {
            id,
            plate_number: draft.plate_number.clone(),
            brand: draft.brand.clone(),
            color: draft.color.clone(),
            owner_id: None,
            parking_spot: draft.parking_spot.clone(),
        }
    }

    fn apply_patch(&mut self, patch: &VehiclePatch) {
        if let Some(brand) = &patch.brand {
            self.brand = Some(brand.clone());
        }
        if let Some(color) = &patch.color {
            self.color = Some(color.clone());
        }
        if let Some(spot) = &patch.parking_spot {
            self.parking_spot = Some(spot.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Rental apartments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalApartment {
    pub id: EntityId,
    pub apartment: String,
    pub tenant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_in: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_out: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RentalDraft {
    pub apartment: String,
    pub tenant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub move_in: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RentalPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub move_out: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl Entity for RentalApartment {
    const KIND: &'static str = "rentals";
    const PATH: &'static str = "/api/rentals";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for RentalApartment {
    type Draft = RentalDraft;
    type Patch = RentalPatch;

    fn materialize(id: EntityId, draft: &RentalDraft) -> Self {
        Self {
            id,
            apartment: draft.apartment.clone(),
            tenant_name: draft.tenant_name.clone(),
            move_in: draft.move_in,
            move_out: None,
            active: true,
        }
    }

    fn apply_patch(&mut self, patch: &RentalPatch) {
        if let Some(name) = &patch.tenant_name {
            self.tenant_name = name.clone();
        }
        if let Some(move_out) = patch.move_out {
            self.move_out = Some(move_out);
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
    }
}

// ---------------------------------------------------------------------------
// Guest access codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestAccessCode {
    pub id: EntityId,
    pub guest_name: String,
    /// Issued by the server; absent while the record is unconfirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestCodeDraft {
    pub guest_name: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestCodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked: Option<bool>,
}

impl Entity for GuestAccessCode {
    const KIND: &'static str = "guest_codes";
    const PATH: &'static str = "/api/guest-codes";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for GuestAccessCode {
    type Draft = GuestCodeDraft;
    type Patch = GuestCodePatch;

    fn materialize(id: EntityId, draft: &GuestCodeDraft) -> Self {
        Self {
            id,
            guest_name: draft.guest_name.clone(),
            code: None,
            valid_from: draft.valid_from,
            valid_until: draft.valid_until,
            revoked: false,
        }
    }

    fn apply_patch(&mut self, patch: &GuestCodePatch) {
        if let Some(until) = patch.valid_until {
            self.valid_until = until;
        }
        if let Some(revoked) = patch.revoked {
            self.revoked = revoked;
        }
    }
}

// ---------------------------------------------------------------------------
// Announcements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub important: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnnouncementDraft {
    pub title: String,
    pub body: String,
    pub important: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnnouncementPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
}

impl Entity for Announcement {
    const KIND: &'static str = "announcements";
    const PATH: &'static str = "/api/announcements";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

impl Mutable for Announcement {
    type Draft = AnnouncementDraft;
    type Patch = AnnouncementPatch;

    fn materialize(id: EntityId, draft: &AnnouncementDraft) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            body: draft.body.clone(),
            important: draft.important,
            author_id: None,
            created_at: Utc::now(),
        }
    }

    fn apply_patch(&mut self, patch: &AnnouncementPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(body) = &patch.body {
            self.body = body.clone();
        }
        if let Some(important) = patch.important {
            self.important = important;
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only collections: meetings, reschedules, chat channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: EntityId,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Entity for Meeting {
    const KIND: &'static str = "meetings";
    const PATH: &'static str = "/api/meetings";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A proposal to move a request's visit to another time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reschedule {
    pub id: EntityId,
    pub request_id: EntityId,
    #[serde(default)]
    pub proposed_by: String,
    pub proposed_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: RescheduleStatus,
}

impl Entity for Reschedule {
    const KIND: &'static str = "reschedules";
    const PATH: &'static str = "/api/reschedules";
    const LIST_PATH: &'static str = "/api/reschedules/pending";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: EntityId,
    pub channel_id: EntityId,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChannel {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Entity for ChatChannel {
    const KIND: &'static str = "chat_channels";
    const PATH: &'static str = "/api/chat/channels";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_accepts_numbers_and_strings() {
        let a: EntityId = serde_json::from_str("42").unwrap();
        let b: EntityId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"42\"");
    }

    #[test]
    fn test_temporary_ids_are_unique_and_marked() {
        let a = EntityId::temporary();
        let b = EntityId::temporary();
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert!(!EntityId::from(7u64).is_temporary());
    }

    #[test]
    fn test_request_materialize_with_executor_is_assigned() {
        let draft = RequestDraft {
            title: "Leak in 4B".to_string(),
            executor_id: Some(EntityId::from("e1")),
            ..Default::default()
        };
        let req = Request::materialize(EntityId::temporary(), &draft);
        assert_eq!(req.status, RequestStatus::Assigned);
        assert_eq!(req.title, "Leak in 4B");
        assert!(req.id.is_temporary());
    }

    #[test]
    fn test_request_patch_touches_only_given_fields() {
        let mut req = Request::materialize(
            EntityId::from("1"),
            &RequestDraft {
                title: "Broken door".to_string(),
                description: "front entrance".to_string(),
                ..Default::default()
            },
        );
        req.apply_patch(&RequestPatch {
            status: Some(RequestStatus::Completed),
            ..Default::default()
        });
        assert_eq!(req.status, RequestStatus::Completed);
        assert!(req.completed_at.is_some());
        assert_eq!(req.title, "Broken door");
        assert_eq!(req.description, "front entrance");
    }

    #[test]
    fn test_patch_serializes_only_set_fields() {
        let patch = VehiclePatch {
            color: Some("red".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"color":"red"}"#);
    }

    #[test]
    fn test_reschedule_lists_pending_path() {
        assert_eq!(Reschedule::LIST_PATH, "/api/reschedules/pending");
        assert_eq!(Request::LIST_PATH, Request::PATH);
    }
}
