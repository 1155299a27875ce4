use call_proto::{DeclineBody, Envelope, ParticipantId, SignalPayload};
use call_relay::{
    registry::{ParticipantRegistry, RegistryConfig},
    relay::Relay,
};
use metrics_exporter_prometheus::PrometheusBuilder;

// The recorder is process-global, so this binary holds a single test.
#[test_timeout::tokio_timeout_test(30)]
async fn relay_activity_shows_up_in_prometheus_output() {
    let handle = PrometheusBuilder::new().install_recorder().unwrap();

    let registry = ParticipantRegistry::new(RegistryConfig::default());
    let relay = Relay::new(registry.clone());
    let patient = registry.open_link();
    registry
        .join(&ParticipantId::from("patient"), &patient.link)
        .await;
    let doctor = registry.open_link();
    registry
        .join(&ParticipantId::from("doctor"), &doctor.link)
        .await;

    let payload = SignalPayload::Decline(DeclineBody {
        appointment_ref: None,
    });
    let envelope = Envelope::new("doctor".into(), "patient".into(), &payload, 1).unwrap();
    relay.forward_from(doctor.link.id(), envelope).await.unwrap();
    let envelope = Envelope::new("doctor".into(), "nobody".into(), &payload, 2).unwrap();
    relay.forward_from(doctor.link.id(), envelope).await.unwrap();

    let rendered = handle.render();
    assert!(rendered.contains("call_relay_links_joined_total 2"), "{rendered}");
    assert!(rendered.contains("call_relay_participants_active 2"), "{rendered}");
    assert!(
        rendered.contains("call_relay_envelopes_relayed_total{type=\"decline\"} 1"),
        "{rendered}"
    );
    assert!(
        rendered.contains("call_relay_envelopes_unreachable_total{type=\"decline\"} 1"),
        "{rendered}"
    );
}
