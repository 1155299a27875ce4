use call_proto::{ParticipantId, PayloadError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] PayloadError),
    #[error("a session with {0} is already in progress")]
    DuplicateSession(ParticipantId),
    #[error("connectivity failed after {attempts} attempts")]
    ConnectivityFailed { attempts: u32 },
    #[error("negotiation backend error: {0}")]
    Backend(String),
    #[error("no negotiation link is open")]
    NoLink,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("call agent has stopped")]
    AgentClosed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("relay rejected registration: {0}")]
    Rejected(String),
    #[error("signaling connection closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) fn to_backend_error<E: std::fmt::Display>(err: E) -> CallError {
    CallError::Backend(err.to_string())
}
