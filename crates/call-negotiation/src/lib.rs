//! Client side of a call: the negotiation state machine, candidate
//! deduplication, connectivity fallback, the signaling relay connection and
//! the driver that ties them to a media backend.

pub mod agent;
pub mod backend;
pub mod candidates;
pub mod config;
pub mod error;
pub mod fallback;
pub mod machine;
pub mod signaling;

pub use agent::{CallAgent, CallHandle, CallStatus};
pub use backend::{NegotiationBackend, TransportEvents};
pub use config::{IceServer, NegotiationConfig, ProfileSettings};
pub use error::{CallError, SignalingError};
pub use fallback::{ConnectivityProfile, RetryState};
pub use machine::{
    AttemptId, CallEvent, CallMachine, CallNotice, CallQuality, CallState, Direction, Effect,
    EndReason, NegotiationSession, TransportStatus,
};
pub use signaling::{SignalSink, SignalingClient};
