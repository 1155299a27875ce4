use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use call_negotiation::{
    CallAgent, CallError, CallHandle, CallMachine, CallNotice, CallQuality, CallState,
    ConnectivityProfile, EndReason, NegotiationBackend, NegotiationConfig, ProfileSettings,
    SignalSink, SignalingError, TransportEvents, TransportStatus,
};
use call_proto::{
    Envelope, EnvelopeKind, ParticipantId, PathCandidate, ServerMessage, SessionDescription,
};
use call_relay::{
    registry::{LinkFrame, ParticipantRegistry, RegistryConfig},
    relay::Relay,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(60);

/// Link stand-in that reports `Connected` once both descriptions are set, or
/// `Failed` for the first `failing_links` links it opens.
struct FakeBackend {
    name: &'static str,
    deny_media: bool,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    failing_links: usize,
    opened: Vec<ConnectivityProfile>,
    added: Vec<PathCandidate>,
    link: Option<FakeLink>,
    closed: usize,
}

struct FakeLink {
    events: TransportEvents,
    fail: bool,
    local: bool,
    remote: bool,
    reported: bool,
}

impl FakeBackend {
    fn new(name: &'static str) -> Arc<Self> {
        Self::build(name, 0, false)
    }

    fn failing(name: &'static str, failing_links: usize) -> Arc<Self> {
        Self::build(name, failing_links, false)
    }

    fn denying(name: &'static str) -> Arc<Self> {
        Self::build(name, 0, true)
    }

    fn build(name: &'static str, failing_links: usize, deny_media: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            deny_media,
            state: Mutex::new(FakeState {
                failing_links,
                ..FakeState::default()
            }),
        })
    }

    fn opened(&self) -> Vec<ConnectivityProfile> {
        self.state.lock().opened.clone()
    }

    fn added(&self) -> Vec<String> {
        self.state
            .lock()
            .added
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    /// Marks one side of the link as described and reports the outcome once
    /// both sides are.
    fn described(&self, local: bool) -> Result<(), CallError> {
        let mut state = self.state.lock();
        let link = state.link.as_mut().ok_or(CallError::NoLink)?;
        if local {
            link.local = true;
        } else {
            link.remote = true;
        }
        if link.local && link.remote && !link.reported {
            link.reported = true;
            link.events.status(TransportStatus::Checking);
            link.events.status(if link.fail {
                TransportStatus::Failed
            } else {
                TransportStatus::Connected
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NegotiationBackend for FakeBackend {
    async fn acquire_media(&self) -> Result<(), CallError> {
        if self.deny_media {
            Err(CallError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    async fn release_media(&self) {}

    async fn open(&self, settings: ProfileSettings, events: TransportEvents) -> Result<(), CallError> {
        let mut state = self.state.lock();
        let fail = state.failing_links > 0;
        if fail {
            state.failing_links -= 1;
        }
        state.opened.push(settings.profile);
        state.link = Some(FakeLink {
            events,
            fail,
            local: false,
            remote: false,
            reported: false,
        });
        Ok(())
    }

    async fn create_offer(&self, _ice_restart: bool) -> Result<SessionDescription, CallError> {
        self.emit_candidate()?;
        self.described(true)?;
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.emit_candidate()?;
        self.described(true)?;
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.name)))
    }

    async fn apply_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), CallError> {
        self.described(false)
    }

    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), CallError> {
        self.state.lock().added.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.link.take().is_some() {
            state.closed += 1;
        }
    }
}

impl FakeBackend {
    fn emit_candidate(&self) -> Result<(), CallError> {
        let state = self.state.lock();
        let link = state.link.as_ref().ok_or(CallError::NoLink)?;
        link.events.candidate(PathCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.1 5000{} typ host",
            self.name,
            state.opened.len()
        )));
        Ok(())
    }
}

/// Hands envelopes to the in-process relay as if they arrived on `link`.
struct LoopbackSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SignalSink for LoopbackSink {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).map_err(|_| SignalingError::Closed)
    }
}

struct Attached {
    sink: Arc<dyn SignalSink>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

async fn attach(relay: &Relay, participant: &str) -> Attached {
    let channel = relay.registry().open_link();
    let link_id = channel.link.id();
    relay
        .registry()
        .join(&ParticipantId::from(participant), &channel.link)
        .await;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let outbound_relay = relay.clone();
    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let _ = outbound_relay.forward_from(link_id, envelope).await;
        }
    });

    let (in_tx, inbound) = mpsc::unbounded_channel::<Envelope>();
    let mut receiver = channel.receiver;
    tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if let LinkFrame::Message(ServerMessage::Signal { envelope }) = frame {
                if in_tx.send(envelope).is_err() {
                    break;
                }
            }
        }
    });

    Attached {
        sink: Arc::new(LoopbackSink { tx: out_tx }),
        inbound,
    }
}

fn test_config() -> NegotiationConfig {
    NegotiationConfig {
        localhost_only: true,
        ..NegotiationConfig::default()
    }
}

async fn spawn_agent(
    relay: &Relay,
    participant: &str,
    display_name: &str,
    backend: Arc<FakeBackend>,
) -> CallHandle {
    let attached = attach(relay, participant).await;
    let machine = CallMachine::new(participant.into(), display_name, test_config());
    CallAgent::spawn_with(machine, backend, attached.sink, attached.inbound)
}

fn new_relay() -> Relay {
    Relay::new(ParticipantRegistry::new(RegistryConfig::default()))
}

async fn wait_for(handle: &CallHandle, state: CallState) {
    tokio::time::timeout(WAIT, handle.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

async fn next_matching<F>(notices: &mut broadcast::Receiver<CallNotice>, mut predicate: F) -> CallNotice
where
    F: FnMut(&CallNotice) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let notice = notices.recv().await.unwrap();
            if predicate(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("notice did not arrive")
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn accepted_call_becomes_active_on_both_sides() {
    let relay = new_relay();
    let doctor_backend = FakeBackend::new("doctor");
    let patient_backend = FakeBackend::new("patient");
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", doctor_backend.clone()).await;
    let patient = spawn_agent(&relay, "patient", "Sam", patient_backend.clone()).await;

    // A second device for the patient sees the same traffic.
    let mut tablet = attach(&relay, "patient").await.inbound;

    let mut patient_notices = patient.subscribe();
    let mut doctor_notices = doctor.subscribe();
    doctor.start_call("patient", Some("appt-42".into())).unwrap();

    wait_for(&patient, CallState::Incoming).await;
    let incoming = next_matching(&mut patient_notices, |n| {
        matches!(n, CallNotice::IncomingCall { .. })
    })
    .await;
    assert_eq!(
        incoming,
        CallNotice::IncomingCall {
            peer: "doctor".into(),
            display_name: Some("Dr. Rivera".into()),
            appointment_ref: Some("appt-42".into()),
        }
    );

    let first = tablet.recv().await.unwrap();
    assert_eq!(first.kind, EnvelopeKind::StartCall);
    assert_eq!(first.from, ParticipantId::from("doctor"));

    patient.accept().unwrap();
    wait_for(&patient, CallState::Active).await;
    wait_for(&doctor, CallState::Active).await;

    let quality = next_matching(&mut doctor_notices, |n| matches!(n, CallNotice::Quality(_))).await;
    assert_eq!(quality, CallNotice::Quality(CallQuality::Good));

    assert_eq!(doctor_backend.opened(), vec![ConnectivityProfile::Full]);
    assert_eq!(patient_backend.opened(), vec![ConnectivityProfile::Full]);
    // The doctor's candidate arrived before the patient accepted and was held
    // until the offer was applied.
    assert!(patient_backend
        .added()
        .iter()
        .any(|c| c.starts_with("candidate:doctor")));
    assert!(doctor_backend
        .added()
        .iter()
        .any(|c| c.starts_with("candidate:patient")));

    doctor.end().unwrap();
    wait_for(&patient, CallState::Idle).await;
    wait_for(&doctor, CallState::Idle).await;
    let ended = next_matching(&mut patient_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "doctor".into(),
            reason: EndReason::RemoteHangup,
        }
    );
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn declined_call_ends_without_retrying() {
    let relay = new_relay();
    let doctor_backend = FakeBackend::new("doctor");
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", doctor_backend.clone()).await;
    let patient = spawn_agent(&relay, "patient", "Sam", FakeBackend::new("patient")).await;

    let mut doctor_notices = doctor.subscribe();
    doctor.start_call("patient", None).unwrap();
    wait_for(&patient, CallState::Incoming).await;

    patient.decline().unwrap();
    wait_for(&patient, CallState::Idle).await;

    let ended = next_matching(&mut doctor_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "patient".into(),
            reason: EndReason::RemoteDeclined,
        }
    );
    wait_for(&doctor, CallState::Idle).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(doctor_backend.opened().len(), 1);
    assert_eq!(doctor.status().retry_count, 0);
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn failed_links_fall_back_to_reduced_profile() {
    let relay = new_relay();
    let doctor_backend = FakeBackend::failing("doctor", 2);
    let patient_backend = FakeBackend::new("patient");
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", doctor_backend.clone()).await;
    let patient = spawn_agent(&relay, "patient", "Sam", patient_backend.clone()).await;

    let mut doctor_notices = doctor.subscribe();
    doctor.start_call("patient", None).unwrap();
    wait_for(&patient, CallState::Incoming).await;
    patient.accept().unwrap();

    next_matching(&mut doctor_notices, |n| {
        *n == CallNotice::Quality(CallQuality::Degraded)
    })
    .await;
    wait_for(&doctor, CallState::Active).await;
    wait_for(&patient, CallState::Active).await;

    assert_eq!(
        doctor_backend.opened(),
        vec![
            ConnectivityProfile::Full,
            ConnectivityProfile::Full,
            ConnectivityProfile::Reduced,
        ]
    );
    // The callee rebuilt its link for every restart offer.
    assert_eq!(patient_backend.opened().len(), 3);
    assert_eq!(doctor.status().retry_count, 0);
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn exhausted_retries_hang_up_both_sides() {
    let relay = new_relay();
    let doctor_backend = FakeBackend::failing("doctor", usize::MAX);
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", doctor_backend.clone()).await;
    let patient = spawn_agent(&relay, "patient", "Sam", FakeBackend::new("patient")).await;

    let mut doctor_notices = doctor.subscribe();
    let mut patient_notices = patient.subscribe();
    doctor.start_call("patient", None).unwrap();
    wait_for(&patient, CallState::Incoming).await;
    patient.accept().unwrap();

    let ended = next_matching(&mut doctor_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "patient".into(),
            reason: EndReason::ConnectivityFailed { attempts: 5 },
        }
    );
    assert_eq!(doctor_backend.opened().len(), 5);
    assert_eq!(
        doctor_backend.opened().last(),
        Some(&ConnectivityProfile::Minimal)
    );

    let ended = next_matching(&mut patient_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "doctor".into(),
            reason: EndReason::RemoteHangup,
        }
    );
    wait_for(&doctor, CallState::Idle).await;
    wait_for(&patient, CallState::Idle).await;
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn denied_media_ends_the_call_for_the_caller() {
    let relay = new_relay();
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", FakeBackend::new("doctor")).await;
    let patient = spawn_agent(&relay, "patient", "Sam", FakeBackend::denying("patient")).await;

    let mut doctor_notices = doctor.subscribe();
    let mut patient_notices = patient.subscribe();
    doctor.start_call("patient", None).unwrap();
    wait_for(&patient, CallState::Incoming).await;
    patient.accept().unwrap();

    let ended = next_matching(&mut patient_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "doctor".into(),
            reason: EndReason::PermissionDenied,
        }
    );
    let ended = next_matching(&mut doctor_notices, |n| matches!(n, CallNotice::Ended { .. })).await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: "patient".into(),
            reason: EndReason::RemoteHangup,
        }
    );
    wait_for(&doctor, CallState::Idle).await;
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn dropping_the_handle_hangs_up() {
    let relay = new_relay();
    let doctor = spawn_agent(&relay, "doctor", "Dr. Rivera", FakeBackend::new("doctor")).await;
    let patient = spawn_agent(&relay, "patient", "Sam", FakeBackend::new("patient")).await;

    doctor.start_call("patient", None).unwrap();
    wait_for(&patient, CallState::Incoming).await;
    patient.accept().unwrap();
    wait_for(&patient, CallState::Active).await;

    drop(doctor);
    wait_for(&patient, CallState::Idle).await;
}
