use std::{net::SocketAddr, sync::Arc, time::Duration};

use call_negotiation::{SignalSink, SignalingClient, SignalingError};
use call_proto::{DeclineBody, Envelope, EnvelopeKind, ParticipantId, SignalPayload};
use call_relay::{
    build_router,
    registry::{ParticipantRegistry, RegistryConfig},
    AppState,
};

const HEARTBEAT: Duration = Duration::from_secs(30);

async fn spawn_relay() -> (SocketAddr, ParticipantRegistry) {
    let registry = ParticipantRegistry::new(RegistryConfig::default());
    let state = Arc::new(AppState::new(registry.clone(), None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    (addr, registry)
}

#[test_timeout::tokio_timeout_test(30)]
async fn clients_exchange_envelopes_through_the_relay() {
    let (addr, registry) = spawn_relay().await;
    let url = format!("http://{addr}");

    let doctor = SignalingClient::connect(&url, "doctor".into(), HEARTBEAT)
        .await
        .unwrap();
    let patient = SignalingClient::connect(&url, "patient".into(), HEARTBEAT)
        .await
        .unwrap();
    assert!(doctor.is_connected());
    assert_eq!(registry.participant_count(), 2);

    let mut inbound = patient.take_inbound().unwrap();
    assert!(patient.take_inbound().is_none());

    // The relay rewrites the sender to the registered id.
    let payload = SignalPayload::Decline(DeclineBody {
        appointment_ref: Some("appt-7".into()),
    });
    let envelope = Envelope::new("someone-else".into(), "patient".into(), &payload, 1).unwrap();
    doctor.send(envelope).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, EnvelopeKind::Decline);
    assert_eq!(received.from, ParticipantId::from("doctor"));
    assert_eq!(received.decode().unwrap(), payload);

    doctor.close();
    assert!(matches!(
        doctor.send(Envelope::new("doctor".into(), "patient".into(), &payload, 2).unwrap()),
        Err(SignalingError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn empty_participant_id_is_rejected() {
    let (addr, _registry) = spawn_relay().await;
    let result = SignalingClient::connect(&format!("ws://{addr}/ws"), "".into(), HEARTBEAT).await;
    assert!(matches!(result, Err(SignalingError::Rejected(_))));
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_relay_reports_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result =
        SignalingClient::connect(&format!("http://{addr}"), "doctor".into(), HEARTBEAT).await;
    assert!(matches!(result, Err(SignalingError::Connect(_))));
}
