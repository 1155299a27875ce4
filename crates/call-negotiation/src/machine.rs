//! Per-participant call state machine.
//!
//! [`CallMachine::handle`] is the single transition function: it consumes one
//! [`CallEvent`] and returns the [`Effect`]s the driver must carry out. It does
//! no I/O, so every transition can be exercised without a transport.

use std::fmt;

use call_proto::{
    AnswerBody, CandidateBody, DeclineBody, DescriptionKind, Envelope, HangupBody, OfferBody,
    ParticipantId, PathCandidate, SessionDescription, SignalPayload, StartCallBody,
};
use tracing::{debug, info, warn};

use crate::{
    candidates::CandidateCache,
    config::{NegotiationConfig, ProfileSettings},
    error::CallError,
    fallback::{ConnectivityProfile, DisconnectAction, FailureAction, FallbackController},
};

/// Identifies one negotiation link. Every feedback event and timer carries
/// the attempt it was issued for and is ignored once that attempt is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Incoming,
    Answering,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Incoming => "incoming",
            CallState::Answering => "answering",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSession {
    pub session_id: String,
    /// Correlates envelopes of this call on both sides.
    pub call_id: String,
    pub peer_id: ParticipantId,
    pub direction: Direction,
    pub state: CallState,
    pub created_at: i64,
    pub appointment_ref: Option<String>,
}

/// Observable connection state of a negotiation link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallQuality {
    Good,
    /// Connected on a reduced traversal profile.
    Degraded,
    Reconnecting,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    RemoteDeclined,
    PermissionDenied,
    ConnectivityFailed { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    StateChanged {
        from: CallState,
        to: CallState,
    },
    IncomingCall {
        peer: ParticipantId,
        display_name: Option<String>,
        appointment_ref: Option<String>,
    },
    Ended {
        peer: ParticipantId,
        reason: EndReason,
    },
    Quality(CallQuality),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StartCall {
        peer: ParticipantId,
        appointment_ref: Option<String>,
    },
    Accept,
    Decline,
    End,
    Inbound(Envelope),
    MediaGranted {
        attempt: AttemptId,
    },
    MediaDenied {
        attempt: AttemptId,
    },
    LocalDescription {
        attempt: AttemptId,
        description: SessionDescription,
    },
    RemoteDescriptionApplied {
        attempt: AttemptId,
    },
    NegotiationFailed {
        attempt: AttemptId,
        reason: String,
    },
    LocalCandidate {
        attempt: AttemptId,
        candidate: PathCandidate,
    },
    Transport {
        attempt: AttemptId,
        status: TransportStatus,
    },
    RetryDue {
        attempt: AttemptId,
    },
    ProbeDue {
        attempt: AttemptId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(Envelope),
    AcquireMedia {
        attempt: AttemptId,
    },
    /// Discard the current link (if any) and build a fresh one.
    OpenLink {
        attempt: AttemptId,
        settings: ProfileSettings,
    },
    CreateOffer {
        attempt: AttemptId,
        ice_restart: bool,
    },
    CreateAnswer {
        attempt: AttemptId,
    },
    ApplyRemote {
        attempt: AttemptId,
        description: SessionDescription,
    },
    AddCandidate {
        attempt: AttemptId,
        candidate: PathCandidate,
    },
    ScheduleRetry {
        attempt: AttemptId,
        delay: std::time::Duration,
    },
    ScheduleProbe {
        attempt: AttemptId,
        delay: std::time::Duration,
    },
    /// Stop local media and close the link.
    Teardown,
    Notify(CallNotice),
}

#[derive(Debug, Clone)]
struct Announcement {
    from: ParticipantId,
    display_name: String,
    appointment_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct LinkProgress {
    open: bool,
    profile: Option<ConnectivityProfile>,
    remote_applied: bool,
    connected: bool,
    awaiting_answer: bool,
    answer_pending: bool,
    ice_restart_pending: bool,
}

/// Everything a live call owns. Replaced wholesale when the call ends.
#[derive(Debug)]
struct SessionContext {
    session: Option<NegotiationSession>,
    fallback: FallbackController,
    candidates: CandidateCache,
    attempt: Option<AttemptId>,
    media_ready: bool,
    link: LinkProgress,
    remote_offer: Option<SessionDescription>,
    announcement: Option<Announcement>,
}

impl SessionContext {
    fn new(config: &NegotiationConfig) -> Self {
        Self {
            session: None,
            fallback: FallbackController::new(
                config.max_retries,
                config.retry_delay,
                config.probe_delay,
            ),
            candidates: CandidateCache::default(),
            attempt: None,
            media_ready: false,
            link: LinkProgress::default(),
            remote_offer: None,
            announcement: None,
        }
    }
}

pub struct CallMachine {
    me: ParticipantId,
    display_name: String,
    config: NegotiationConfig,
    ctx: SessionContext,
    next_attempt: u64,
}

impl CallMachine {
    pub fn new(me: ParticipantId, display_name: impl Into<String>, config: NegotiationConfig) -> Self {
        let ctx = SessionContext::new(&config);
        Self {
            me,
            display_name: display_name.into(),
            config,
            ctx,
            next_attempt: 0,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.me
    }

    pub fn state(&self) -> CallState {
        self.ctx
            .session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.ctx.session.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.ctx.fallback.retry().count()
    }

    pub fn is_retrying(&self) -> bool {
        self.ctx.fallback.retry().is_retrying()
    }

    pub fn live_attempt(&self) -> Option<AttemptId> {
        self.ctx.attempt
    }

    pub fn pending_candidates(&self) -> usize {
        self.ctx.candidates.pending_len()
    }

    pub fn handle(&mut self, event: CallEvent, now_ms: i64) -> Vec<Effect> {
        let mut out = Vec::new();
        match event {
            CallEvent::StartCall {
                peer,
                appointment_ref,
            } => self.start_call(&mut out, peer, appointment_ref, now_ms),
            CallEvent::Accept => self.accept(&mut out),
            CallEvent::Decline => self.decline(&mut out, now_ms),
            CallEvent::End => {
                if self.state() != CallState::Idle {
                    self.send_hangup(&mut out, now_ms);
                    self.end_session(&mut out, EndReason::LocalHangup);
                }
            }
            CallEvent::Inbound(envelope) => self.inbound(&mut out, envelope, now_ms),
            CallEvent::MediaGranted { attempt } if self.is_live(attempt) => {
                self.media_granted(&mut out, attempt)
            }
            CallEvent::MediaDenied { attempt } if self.is_live(attempt) => {
                warn!(target = "call", %attempt, "{}", CallError::PermissionDenied);
                self.send_hangup(&mut out, now_ms);
                self.end_session(&mut out, EndReason::PermissionDenied);
            }
            CallEvent::LocalDescription {
                attempt,
                description,
            } if self.is_live(attempt) => self.local_description(&mut out, description, now_ms),
            CallEvent::RemoteDescriptionApplied { attempt } if self.is_live(attempt) => {
                self.remote_applied(&mut out, attempt)
            }
            CallEvent::NegotiationFailed { attempt, reason } if self.is_live(attempt) => {
                warn!(target = "call", %attempt, %reason, "negotiation step failed");
                self.connectivity_failed(&mut out, now_ms);
            }
            CallEvent::LocalCandidate { attempt, candidate } if self.is_live(attempt) => {
                if let Some(session) = self.ctx.session.as_ref() {
                    let payload = SignalPayload::Candidate(CandidateBody {
                        call_id: session.call_id.clone(),
                        candidate,
                    });
                    let peer = session.peer_id.clone();
                    self.send(&mut out, peer, payload, now_ms);
                }
            }
            CallEvent::Transport { attempt, status } if self.is_live(attempt) => {
                self.transport(&mut out, attempt, status, now_ms)
            }
            CallEvent::RetryDue { attempt } if self.is_live(attempt) => self.retry_due(&mut out),
            CallEvent::ProbeDue { attempt } if self.is_live(attempt) => {
                self.probe_due(&mut out, attempt)
            }
            stale => {
                debug!(target = "call", event = ?stale, "ignoring event for a stale attempt");
            }
        }
        out
    }

    fn is_live(&self, attempt: AttemptId) -> bool {
        self.ctx.attempt == Some(attempt)
    }

    fn new_attempt(&mut self) -> AttemptId {
        self.next_attempt += 1;
        let attempt = AttemptId(self.next_attempt);
        self.ctx.attempt = Some(attempt);
        attempt
    }

    fn start_call(
        &mut self,
        out: &mut Vec<Effect>,
        peer: ParticipantId,
        appointment_ref: Option<String>,
        now_ms: i64,
    ) {
        if self.state() != CallState::Idle {
            debug!(target = "call", %peer, "start ignored; a call is already in progress");
            return;
        }
        if peer.is_empty() || peer == self.me {
            warn!(target = "call", %peer, "start ignored; invalid peer");
            return;
        }

        let session_id = format!("{peer}:{now_ms}");
        self.ctx.announcement = None;
        self.ctx.session = Some(NegotiationSession {
            call_id: session_id.clone(),
            session_id,
            peer_id: peer.clone(),
            direction: Direction::Outgoing,
            state: CallState::Idle,
            created_at: now_ms,
            appointment_ref: appointment_ref.clone(),
        });
        self.transition(out, CallState::Answering);
        info!(target = "call", %peer, "starting call");

        let announce = SignalPayload::StartCall(StartCallBody {
            from_display_name: self.display_name.clone(),
            appointment_ref,
        });
        self.send(out, peer, announce, now_ms);
        let attempt = self.new_attempt();
        out.push(Effect::AcquireMedia { attempt });
    }

    fn accept(&mut self, out: &mut Vec<Effect>) {
        if self.state() != CallState::Incoming {
            debug!(target = "call", state = %self.state(), "accept ignored");
            return;
        }
        self.transition(out, CallState::Answering);
        let attempt = self.new_attempt();
        out.push(Effect::AcquireMedia { attempt });
    }

    fn decline(&mut self, out: &mut Vec<Effect>, now_ms: i64) {
        let Some(session) = self.ctx.session.as_ref() else {
            return;
        };
        if session.state != CallState::Incoming {
            debug!(target = "call", state = %session.state, "decline ignored");
            return;
        }
        let payload = SignalPayload::Decline(DeclineBody {
            appointment_ref: session.appointment_ref.clone(),
        });
        let peer = session.peer_id.clone();
        self.send(out, peer, payload, now_ms);
        self.end_session(out, EndReason::Declined);
    }

    fn media_granted(&mut self, out: &mut Vec<Effect>, attempt: AttemptId) {
        let Some(direction) = self.ctx.session.as_ref().map(|s| s.direction) else {
            return;
        };
        self.ctx.media_ready = true;
        match direction {
            Direction::Outgoing => {
                self.open_link(out, attempt, self.ctx.fallback.profile());
                out.push(Effect::CreateOffer {
                    attempt,
                    ice_restart: false,
                });
            }
            Direction::Incoming => {
                let profile = self
                    .ctx
                    .link
                    .profile
                    .unwrap_or(ConnectivityProfile::Full);
                self.open_link(out, attempt, profile);
                if let Some(offer) = self.ctx.remote_offer.take() {
                    self.ctx.link.answer_pending = true;
                    out.push(Effect::ApplyRemote {
                        attempt,
                        description: offer,
                    });
                }
            }
        }
    }

    fn open_link(&mut self, out: &mut Vec<Effect>, attempt: AttemptId, profile: ConnectivityProfile) {
        self.ctx.link = LinkProgress {
            open: true,
            profile: Some(profile),
            ..LinkProgress::default()
        };
        debug!(target = "call", %attempt, %profile, "opening negotiation link");
        out.push(Effect::OpenLink {
            attempt,
            settings: self.config.settings_for(profile),
        });
    }

    fn local_description(
        &mut self,
        out: &mut Vec<Effect>,
        description: SessionDescription,
        now_ms: i64,
    ) {
        let Some(session) = self.ctx.session.as_ref() else {
            return;
        };
        let peer = session.peer_id.clone();
        let call_id = session.call_id.clone();
        let payload = match description.kind {
            DescriptionKind::Offer => {
                self.ctx.link.awaiting_answer = true;
                let ice_restart = std::mem::take(&mut self.ctx.link.ice_restart_pending);
                SignalPayload::Offer(OfferBody {
                    call_id,
                    offer: description,
                    retry: self.ctx.fallback.retry().count(),
                    ice_restart,
                })
            }
            DescriptionKind::Answer => {
                self.ctx.link.answer_pending = false;
                SignalPayload::Answer(AnswerBody {
                    call_id,
                    answer: description,
                })
            }
        };
        self.send(out, peer, payload, now_ms);
    }

    fn remote_applied(&mut self, out: &mut Vec<Effect>, attempt: AttemptId) {
        self.ctx.link.remote_applied = true;
        for candidate in self.ctx.candidates.drain_pending() {
            out.push(Effect::AddCandidate { attempt, candidate });
        }
        if self.ctx.link.answer_pending {
            out.push(Effect::CreateAnswer { attempt });
        }
        self.maybe_activate(out);
    }

    fn maybe_activate(&mut self, out: &mut Vec<Effect>) {
        if self.state() == CallState::Answering
            && self.ctx.link.remote_applied
            && self.ctx.link.connected
        {
            self.transition(out, CallState::Active);
        }
    }

    fn transport(
        &mut self,
        out: &mut Vec<Effect>,
        attempt: AttemptId,
        status: TransportStatus,
        now_ms: i64,
    ) {
        match status {
            TransportStatus::Connected | TransportStatus::Completed => {
                let was_connected = std::mem::replace(&mut self.ctx.link.connected, true);
                let cleared = self.ctx.fallback.on_connected();
                if cleared > 0 {
                    info!(target = "call", retries = cleared, "link recovered");
                }
                self.maybe_activate(out);
                if !was_connected {
                    let quality = match self.ctx.link.profile {
                        Some(ConnectivityProfile::Full) | None => CallQuality::Good,
                        Some(_) => CallQuality::Degraded,
                    };
                    out.push(Effect::Notify(CallNotice::Quality(quality)));
                }
            }
            TransportStatus::Disconnected => {
                self.ctx.link.connected = false;
                match self.ctx.fallback.on_disconnected() {
                    DisconnectAction::ArmProbe { delay } => {
                        out.push(Effect::Notify(CallNotice::Quality(
                            CallQuality::Reconnecting,
                        )));
                        out.push(Effect::ScheduleProbe { attempt, delay });
                    }
                    DisconnectAction::Wait => {}
                    DisconnectAction::Escalate => self.connectivity_failed(out, now_ms),
                }
            }
            TransportStatus::Failed => {
                self.ctx.link.connected = false;
                self.connectivity_failed(out, now_ms);
            }
            TransportStatus::New | TransportStatus::Checking | TransportStatus::Closed => {}
        }
    }

    fn connectivity_failed(&mut self, out: &mut Vec<Effect>, now_ms: i64) {
        let Some(session) = self.ctx.session.as_ref() else {
            return;
        };
        let initiator = session.direction == Direction::Outgoing;
        let Some(attempt) = self.ctx.attempt else {
            return;
        };
        match self.ctx.fallback.on_failure(initiator) {
            FailureAction::Retry {
                delay,
                count,
                profile,
            } => {
                info!(
                    target = "call",
                    retry = count,
                    %profile,
                    delay_ms = delay.as_millis() as u64,
                    "connectivity failed; scheduling retry"
                );
                out.push(Effect::Notify(CallNotice::Quality(CallQuality::Reconnecting)));
                out.push(Effect::ScheduleRetry { attempt, delay });
            }
            FailureAction::Exhausted { attempts } => {
                warn!(target = "call", "{}", CallError::ConnectivityFailed { attempts });
                self.send_hangup(out, now_ms);
                self.end_session(out, EndReason::ConnectivityFailed { attempts });
            }
            FailureAction::AwaitPeer => {
                out.push(Effect::Notify(CallNotice::Quality(CallQuality::Poor)));
            }
        }
    }

    fn retry_due(&mut self, out: &mut Vec<Effect>) {
        if !matches!(self.state(), CallState::Answering | CallState::Active) {
            return;
        }
        let attempt = self.new_attempt();
        if self.state() == CallState::Active {
            self.transition(out, CallState::Answering);
        }
        self.ctx.candidates.discard_pending();
        self.open_link(out, attempt, self.ctx.fallback.profile());
        out.push(Effect::CreateOffer {
            attempt,
            ice_restart: false,
        });
    }

    fn probe_due(&mut self, out: &mut Vec<Effect>, attempt: AttemptId) {
        let still_disconnected = !self.ctx.link.connected;
        if !self.ctx.fallback.on_probe(still_disconnected) {
            return;
        }
        let initiator = self
            .ctx
            .session
            .as_ref()
            .is_some_and(|s| s.direction == Direction::Outgoing);
        if initiator {
            info!(target = "call", %attempt, "link still down; restarting ICE in place");
            self.ctx.link.ice_restart_pending = true;
            out.push(Effect::CreateOffer {
                attempt,
                ice_restart: true,
            });
        }
    }

    fn inbound(&mut self, out: &mut Vec<Effect>, envelope: Envelope, now_ms: i64) {
        if envelope.to != self.me {
            debug!(target = "call", to = %envelope.to, "envelope addressed elsewhere");
            return;
        }
        let payload = match envelope.decode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target = "call",
                    from = %envelope.from,
                    kind = envelope.kind.as_str(),
                    "{}",
                    CallError::InvalidEnvelope(err)
                );
                return;
            }
        };
        let from = envelope.from;

        match payload {
            SignalPayload::StartCall(body) => {
                if self.state() == CallState::Idle {
                    self.ctx.announcement = Some(Announcement {
                        from,
                        display_name: body.from_display_name,
                        appointment_ref: body.appointment_ref,
                    });
                } else {
                    debug!(target = "call", %from, "busy; ignoring call announcement");
                }
            }
            SignalPayload::Offer(body) => self.inbound_offer(out, from, body, now_ms),
            SignalPayload::Answer(body) => {
                let expected = self.matches_call(&from, &body.call_id)
                    && self.ctx.session.as_ref().map(|s| s.direction) == Some(Direction::Outgoing)
                    && self.ctx.link.awaiting_answer;
                let Some(attempt) = self.ctx.attempt.filter(|_| expected) else {
                    debug!(target = "call", %from, "ignoring unexpected answer");
                    return;
                };
                self.ctx.link.awaiting_answer = false;
                out.push(Effect::ApplyRemote {
                    attempt,
                    description: body.answer,
                });
            }
            SignalPayload::Candidate(body) => self.inbound_candidate(out, from, body),
            SignalPayload::Decline(_) => {
                let outgoing = self
                    .ctx
                    .session
                    .as_ref()
                    .is_some_and(|s| s.peer_id == from && s.direction == Direction::Outgoing);
                if outgoing {
                    info!(target = "call", peer = %from, "call declined");
                    self.end_session(out, EndReason::RemoteDeclined);
                }
            }
            SignalPayload::Hangup(body) => {
                if self.matches_call(&from, &body.call_id) {
                    info!(target = "call", peer = %from, "peer hung up");
                    self.end_session(out, EndReason::RemoteHangup);
                }
            }
        }
    }

    fn matches_call(&self, from: &ParticipantId, call_id: &str) -> bool {
        self.ctx
            .session
            .as_ref()
            .is_some_and(|s| &s.peer_id == from && s.call_id == call_id)
    }

    fn inbound_offer(
        &mut self,
        out: &mut Vec<Effect>,
        from: ParticipantId,
        body: OfferBody,
        now_ms: i64,
    ) {
        let state = self.state();
        if state == CallState::Idle {
            if body.retry > 0 || body.ice_restart {
                debug!(target = "call", %from, "restart offer for a call that is not live");
                return;
            }
            let announcement = self.ctx.announcement.take().filter(|a| a.from == from);
            self.ctx.session = Some(NegotiationSession {
                session_id: format!("{from}:{now_ms}"),
                call_id: body.call_id,
                peer_id: from.clone(),
                direction: Direction::Incoming,
                state: CallState::Idle,
                created_at: now_ms,
                appointment_ref: announcement.as_ref().and_then(|a| a.appointment_ref.clone()),
            });
            self.ctx.remote_offer = Some(body.offer);
            self.transition(out, CallState::Incoming);
            out.push(Effect::Notify(CallNotice::IncomingCall {
                peer: from,
                display_name: announcement.as_ref().map(|a| a.display_name.clone()),
                appointment_ref: announcement.and_then(|a| a.appointment_ref),
            }));
            return;
        }

        let same_call = (body.retry > 0 || body.ice_restart)
            && self.matches_call(&from, &body.call_id)
            && self.ctx.session.as_ref().map(|s| s.direction) == Some(Direction::Incoming);
        if same_call && state == CallState::Incoming {
            // Still ringing; the caller now waits on this offer instead.
            debug!(target = "call", %from, retry = body.retry, "replacing unanswered offer");
            self.ctx.remote_offer = Some(body.offer);
            if body.retry > 0 {
                self.ctx.link.profile = Some(ConnectivityProfile::for_failures(body.retry));
                self.ctx.candidates.discard_pending();
            }
            return;
        }
        let is_restart = same_call && matches!(state, CallState::Answering | CallState::Active);
        if !is_restart {
            debug!(
                target = "call",
                %from,
                %state,
                "{}",
                CallError::DuplicateSession(from.clone())
            );
            return;
        }

        if !self.ctx.media_ready {
            // Not yet attached; the newest offer is applied once media arrives.
            self.ctx.remote_offer = Some(body.offer);
            self.ctx.link.profile = Some(ConnectivityProfile::for_failures(body.retry));
            return;
        }

        let attempt = if body.ice_restart {
            match self.ctx.attempt {
                Some(attempt) => attempt,
                None => return,
            }
        } else {
            let attempt = self.new_attempt();
            if state == CallState::Active {
                self.transition(out, CallState::Answering);
            }
            info!(target = "call", retry = body.retry, "peer restarted negotiation");
            self.ctx.candidates.discard_pending();
            self.open_link(out, attempt, ConnectivityProfile::for_failures(body.retry));
            attempt
        };
        self.ctx.link.answer_pending = true;
        out.push(Effect::ApplyRemote {
            attempt,
            description: body.offer,
        });
    }

    fn inbound_candidate(&mut self, out: &mut Vec<Effect>, from: ParticipantId, body: CandidateBody) {
        if !self.matches_call(&from, &body.call_id) {
            debug!(target = "call", %from, "candidate for a call that is not live");
            return;
        }
        if !self.ctx.candidates.admit(&from, &body.candidate) {
            debug!(target = "call", %from, "duplicate candidate dropped");
            return;
        }
        match self.ctx.attempt {
            Some(attempt) if self.ctx.link.open && self.ctx.link.remote_applied => {
                out.push(Effect::AddCandidate {
                    attempt,
                    candidate: body.candidate,
                });
            }
            _ => self.ctx.candidates.queue(body.candidate),
        }
    }

    fn send_hangup(&mut self, out: &mut Vec<Effect>, now_ms: i64) {
        if let Some(session) = self.ctx.session.as_ref() {
            let payload = SignalPayload::Hangup(HangupBody {
                call_id: session.call_id.clone(),
            });
            let peer = session.peer_id.clone();
            self.send(out, peer, payload, now_ms);
        }
    }

    fn send(&self, out: &mut Vec<Effect>, to: ParticipantId, payload: SignalPayload, now_ms: i64) {
        match Envelope::new(self.me.clone(), to, &payload, now_ms) {
            Ok(envelope) => out.push(Effect::Send(envelope)),
            Err(err) => warn!(target = "call", error = %err, "failed to encode envelope"),
        }
    }

    fn transition(&mut self, out: &mut Vec<Effect>, to: CallState) {
        if let Some(session) = self.ctx.session.as_mut() {
            let from = std::mem::replace(&mut session.state, to);
            if from != to {
                debug!(target = "call", %from, %to, "state changed");
                out.push(Effect::Notify(CallNotice::StateChanged { from, to }));
            }
        }
    }

    fn end_session(&mut self, out: &mut Vec<Effect>, reason: EndReason) {
        let Some(session) = self.ctx.session.take() else {
            return;
        };
        info!(
            target = "call",
            session_id = %session.session_id,
            peer = %session.peer_id,
            ?reason,
            "call ended"
        );
        out.push(Effect::Teardown);
        out.push(Effect::Notify(CallNotice::StateChanged {
            from: session.state,
            to: CallState::Ended,
        }));
        out.push(Effect::Notify(CallNotice::Ended {
            peer: session.peer_id,
            reason,
        }));
        out.push(Effect::Notify(CallNotice::StateChanged {
            from: CallState::Ended,
            to: CallState::Idle,
        }));
        self.ctx = SessionContext::new(&self.config);
    }
}
