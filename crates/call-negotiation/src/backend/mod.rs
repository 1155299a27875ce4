//! Seam between the call driver and the media/connectivity stack.

pub mod webrtc;

use async_trait::async_trait;
use call_proto::{PathCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::{
    config::ProfileSettings,
    error::CallError,
    machine::{AttemptId, CallEvent, TransportStatus},
};

/// Reports asynchronous link activity back to the driver, tagged with the
/// attempt the link was opened for.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl TransportEvents {
    pub(crate) fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn candidate(&self, candidate: PathCandidate) {
        let _ = self.tx.send(CallEvent::LocalCandidate {
            attempt: self.attempt,
            candidate,
        });
    }

    pub fn status(&self, status: TransportStatus) {
        let _ = self.tx.send(CallEvent::Transport {
            attempt: self.attempt,
            status,
        });
    }
}

/// One negotiation link at a time. `open` replaces whatever link exists.
#[async_trait]
pub trait NegotiationBackend: Send + Sync + 'static {
    /// Resolves to `CallError::PermissionDenied` when the user refuses.
    async fn acquire_media(&self) -> Result<(), CallError>;

    async fn release_media(&self);

    async fn open(&self, settings: ProfileSettings, events: TransportEvents) -> Result<(), CallError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn apply_remote_description(&self, description: SessionDescription)
        -> Result<(), CallError>;

    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), CallError>;

    async fn close(&self);
}
