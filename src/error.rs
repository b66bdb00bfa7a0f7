//! Error taxonomy for the realtime sync layer.
//!
//! Each layer has its own error type so callers can tell a transient
//! connectivity failure (retried automatically) from an auth rejection
//! (terminal for the current token) from an optimistic-operation failure
//! (already rolled back by the time the caller sees it).

use thiserror::Error;

/// Realtime channel errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected the session token. Never retried with the same token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure must be escalated instead of retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// REST collaborator errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Failure result of a façade operation. When returned from a mutating
/// operation the local collection has already been rolled back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The record still carries a temporary id; the server does not know it yet.
    #[error("Record not yet confirmed by the server: {0}")]
    Unconfirmed(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Inbound frame decoding errors. Never propagated past the router.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Bad payload for '{kind}': {source}")]
    BadPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
