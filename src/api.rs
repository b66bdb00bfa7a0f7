//! REST collaborator surface consumed by the data store.
//!
//! The store only sees the [`ListApi`] / [`MutateApi`] traits. [`HttpApi`]
//! implements them for every entity over reqwest, attaching the session
//! token explicitly on each call.

use crate::error::ApiError;
use crate::model::{
    Announcement, ChatChannel, Entity, EntityId, Executor, GuestAccessCode, Meeting, Mutable,
    RentalApartment, Request, Reschedule, Vehicle,
};
use crate::session::SessionContext;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Fetch a whole collection.
#[async_trait]
pub trait ListApi<T: Entity>: Send + Sync {
    async fn list(&self) -> Result<Vec<T>, ApiError>;
}

/// Per-entity mutations, each returning the canonical record.
#[async_trait]
pub trait MutateApi<T: Mutable>: Send + Sync {
    async fn create(&self, draft: &T::Draft) -> Result<T, ApiError>;
    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, ApiError>;
    async fn delete(&self, id: &EntityId) -> Result<(), ApiError>;
}

/// Everything the store needs from the server.
pub trait CrmApi:
    ListApi<Request>
    + MutateApi<Request>
    + ListApi<Executor>
    + MutateApi<Executor>
    + ListApi<Vehicle>
    + MutateApi<Vehicle>
    + ListApi<RentalApartment>
    + MutateApi<RentalApartment>
    + ListApi<GuestAccessCode>
    + MutateApi<GuestAccessCode>
    + ListApi<Announcement>
    + MutateApi<Announcement>
    + ListApi<Meeting>
    + ListApi<Reschedule>
    + ListApi<ChatChannel>
{
}

impl<A> CrmApi for A where
    A: ListApi<Request>
        + MutateApi<Request>
        + ListApi<Executor>
        + MutateApi<Executor>
        + ListApi<Vehicle>
        + MutateApi<Vehicle>
        + ListApi<RentalApartment>
        + MutateApi<RentalApartment>
        + ListApi<GuestAccessCode>
        + MutateApi<GuestAccessCode>
        + ListApi<Announcement>
        + MutateApi<Announcement>
        + ListApi<Meeting>
        + ListApi<Reschedule>
        + ListApi<ChatChannel>
{
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Servers answer either with the bare payload or `{ "data": … }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Body<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Body<T> {
    fn into_inner(self) -> T {
        match self {
            Body::Wrapped { data } => data,
            Body::Bare(inner) => inner,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    session: Arc<SessionContext>,
}

impl HttpApi {
    pub fn new(base_url: &str, session: Arc<SessionContext>) -> Result<Self, ApiError> {
        let base = Url::parse(base_url).map_err(|e| ApiError::Network(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base,
            session,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Network(format!("bad path {}: {}", path, e)))
    }

    fn item_url(&self, path: &str, id: &EntityId) -> Result<Url, ApiError> {
        self.url(&format!("{}/{}", path.trim_end_matches('/'), id))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.bearer_auth(&self.session.token).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, ApiError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice::<Body<R>>(&bytes)
            .map(Body::into_inner)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl<T: Entity> ListApi<T> for HttpApi {
    async fn list(&self) -> Result<Vec<T>, ApiError> {
        let url = self.url(T::LIST_PATH)?;
        debug!(kind = T::KIND, %url, "GET collection");
        let response = self.send(self.client.get(url)).await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl<T: Mutable> MutateApi<T> for HttpApi {
    async fn create(&self, draft: &T::Draft) -> Result<T, ApiError> {
        let url = self.url(T::PATH)?;
        debug!(kind = T::KIND, %url, "POST");
        let response = self.send(self.client.post(url).json(draft)).await?;
        Self::decode(response).await
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, ApiError> {
        let url = self.item_url(T::PATH, id)?;
        debug!(kind = T::KIND, %url, "PATCH");
        let response = self.send(self.client.patch(url).json(patch)).await?;
        Self::decode(response).await
    }

    async fn delete(&self, id: &EntityId) -> Result<(), ApiError> {
        let url = self.item_url(T::PATH, id)?;
        debug!(kind = T::KIND, %url, "DELETE");
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}
