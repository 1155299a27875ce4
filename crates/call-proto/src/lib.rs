//! Signaling wire types.
//!
//! The relay only understands the outer [`Envelope`] header (`type`, `from`,
//! `to`, `timestamp`); the `payload` travels as opaque JSON and is decoded by
//! the negotiation clients through [`SignalPayload`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable participant identifier issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    StartCall,
    Offer,
    Answer,
    Candidate,
    Decline,
    Hangup,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::StartCall => "start_call",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Decline => "decline",
            EnvelopeKind::Hangup => "hangup",
        }
    }
}

/// A routed signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the unix epoch, stamped by the sender.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Builds an envelope from a typed payload; the kind follows the payload.
    pub fn new(
        from: ParticipantId,
        to: ParticipantId,
        payload: &SignalPayload,
        timestamp: i64,
    ) -> Result<Self, PayloadError> {
        Ok(Self {
            kind: payload.kind(),
            from,
            to,
            payload: payload.body_value()?,
            timestamp,
        })
    }

    /// Decodes the opaque payload according to the envelope kind.
    pub fn decode(&self) -> Result<SignalPayload, PayloadError> {
        SignalPayload::decode(self.kind, &self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network path candidate proposed during connectivity negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment of the generation the candidate belongs to, when
    /// the sender reports one. Part of the dedup signature, so candidates that
    /// differ only in fragment are kept apart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl PathCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartCallBody {
    pub from_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferBody {
    pub call_id: String,
    pub offer: SessionDescription,
    /// Zero for the first offer of a call; the retry number for restarts.
    #[serde(default)]
    pub retry: u32,
    /// Renegotiates the existing link in place instead of replacing it.
    #[serde(default)]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerBody {
    pub call_id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBody {
    pub call_id: String,
    pub candidate: PathCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclineBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupBody {
    pub call_id: String,
}

/// Typed view of an envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    StartCall(StartCallBody),
    Offer(OfferBody),
    Answer(AnswerBody),
    Candidate(CandidateBody),
    Decline(DeclineBody),
    Hangup(HangupBody),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("description kind does not match envelope type {0}")]
    KindMismatch(&'static str),
}

impl SignalPayload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SignalPayload::StartCall(_) => EnvelopeKind::StartCall,
            SignalPayload::Offer(_) => EnvelopeKind::Offer,
            SignalPayload::Answer(_) => EnvelopeKind::Answer,
            SignalPayload::Candidate(_) => EnvelopeKind::Candidate,
            SignalPayload::Decline(_) => EnvelopeKind::Decline,
            SignalPayload::Hangup(_) => EnvelopeKind::Hangup,
        }
    }

    fn body_value(&self) -> Result<Value, PayloadError> {
        let value = match self {
            SignalPayload::StartCall(body) => serde_json::to_value(body),
            SignalPayload::Offer(body) => serde_json::to_value(body),
            SignalPayload::Answer(body) => serde_json::to_value(body),
            SignalPayload::Candidate(body) => serde_json::to_value(body),
            SignalPayload::Decline(body) => serde_json::to_value(body),
            SignalPayload::Hangup(body) => serde_json::to_value(body),
        };
        value.map_err(PayloadError::Encode)
    }

    pub fn decode(kind: EnvelopeKind, payload: &Value) -> Result<Self, PayloadError> {
        fn body<T: serde::de::DeserializeOwned>(
            kind: EnvelopeKind,
            payload: &Value,
        ) -> Result<T, PayloadError> {
            T::deserialize(payload).map_err(|source| PayloadError::Malformed {
                kind: kind.as_str(),
                source,
            })
        }

        let decoded = match kind {
            EnvelopeKind::StartCall => SignalPayload::StartCall(body(kind, payload)?),
            EnvelopeKind::Offer => {
                let offer: OfferBody = body(kind, payload)?;
                if offer.offer.kind != DescriptionKind::Offer {
                    return Err(PayloadError::KindMismatch(kind.as_str()));
                }
                SignalPayload::Offer(offer)
            }
            EnvelopeKind::Answer => {
                let answer: AnswerBody = body(kind, payload)?;
                if answer.answer.kind != DescriptionKind::Answer {
                    return Err(PayloadError::KindMismatch(kind.as_str()));
                }
                SignalPayload::Answer(answer)
            }
            EnvelopeKind::Candidate => SignalPayload::Candidate(body(kind, payload)?),
            EnvelopeKind::Decline => SignalPayload::Decline(body(kind, payload)?),
            EnvelopeKind::Hangup => SignalPayload::Hangup(body(kind, payload)?),
        };
        Ok(decoded)
    }
}

/// Messages sent from a client link to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Associate this link with a participant id. Idempotent.
    Register { participant_id: ParticipantId },
    /// Route an envelope to every link of `envelope.to`.
    Signal { envelope: Envelope },
    Ping,
}

/// Messages sent from the relay to a client link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        participant_id: ParticipantId,
        links: usize,
    },
    Signal {
        envelope: Envelope,
    },
    Pong,
    Error {
        message: String,
    },
}
