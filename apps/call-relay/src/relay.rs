use call_proto::{Envelope, ServerMessage};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::registry::{LinkId, ParticipantRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("link {0} has not registered a participant id")]
    NotRegistered(LinkId),
    #[error("envelope has no recipient")]
    MissingRecipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { links: usize, dropped: usize },
    /// No link is registered for the recipient. The envelope is discarded and
    /// the sender is not told.
    Unreachable,
}

/// Stateless envelope router on top of the registry.
#[derive(Clone)]
pub struct Relay {
    registry: ParticipantRegistry,
}

impl Relay {
    pub fn new(registry: ParticipantRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    /// Forwards an envelope received on `link_id`. The `from` header is
    /// replaced with the participant id the link registered under.
    pub async fn forward_from(
        &self,
        link_id: LinkId,
        mut envelope: Envelope,
    ) -> Result<RelayOutcome, RelayError> {
        let sender = self
            .registry
            .owner_of(link_id)
            .ok_or(RelayError::NotRegistered(link_id))?;
        envelope.from = sender;
        self.forward(envelope).await
    }

    /// Delivers the envelope to every link registered for `envelope.to`.
    pub async fn forward(&self, envelope: Envelope) -> Result<RelayOutcome, RelayError> {
        if envelope.to.is_empty() {
            return Err(RelayError::MissingRecipient);
        }

        let kind = envelope.kind.as_str();
        let to = envelope.to.clone();
        let from = envelope.from.clone();
        match self
            .registry
            .deliver(&to, ServerMessage::Signal { envelope })
            .await
        {
            Some(metrics) => {
                counter!("call_relay_envelopes_relayed_total", "type" => kind).increment(1);
                debug!(
                    %from,
                    %to,
                    kind,
                    delivered = metrics.delivered,
                    dropped = metrics.dropped,
                    "relayed envelope"
                );
                Ok(RelayOutcome::Delivered {
                    links: metrics.delivered,
                    dropped: metrics.dropped,
                })
            }
            None => {
                counter!("call_relay_envelopes_unreachable_total", "type" => kind).increment(1);
                debug!(%from, %to, kind, "recipient not connected; dropping envelope");
                Ok(RelayOutcome::Unreachable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LinkFrame, RegistryConfig};
    use call_proto::{DeclineBody, ParticipantId, SignalPayload};

    fn decline(from: &str, to: &str) -> Envelope {
        let payload = SignalPayload::Decline(DeclineBody {
            appointment_ref: Some("appt-1".into()),
        });
        Envelope::new(from.into(), to.into(), &payload, 1).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn forwards_to_every_recipient_link_and_stamps_sender() {
        let registry = ParticipantRegistry::new(RegistryConfig::default());
        let relay = Relay::new(registry.clone());

        let doctor = registry.open_link();
        let mut phone = registry.open_link();
        let mut tablet = registry.open_link();
        registry.join(&"doctor".into(), &doctor.link).await;
        registry.join(&"patient".into(), &phone.link).await;
        registry.join(&"patient".into(), &tablet.link).await;

        let outcome = relay
            .forward_from(doctor.link.id(), decline("spoofed", "patient"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::Delivered {
                links: 2,
                dropped: 0
            }
        );

        for receiver in [&mut phone.receiver, &mut tablet.receiver] {
            match receiver.try_recv() {
                Ok(LinkFrame::Message(ServerMessage::Signal { envelope })) => {
                    assert_eq!(envelope.from, ParticipantId::from("doctor"));
                    assert_eq!(envelope.payload["appointment_ref"], "appt-1");
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_recipient_is_silently_unreachable() {
        let registry = ParticipantRegistry::new(RegistryConfig::default());
        let relay = Relay::new(registry.clone());
        let mut doctor = registry.open_link();
        registry.join(&"doctor".into(), &doctor.link).await;

        let outcome = relay
            .forward_from(doctor.link.id(), decline("doctor", "nobody"))
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Unreachable);
        assert!(doctor.receiver.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unregistered_links_cannot_send() {
        let registry = ParticipantRegistry::new(RegistryConfig::default());
        let relay = Relay::new(registry.clone());
        let anonymous = registry.open_link();

        let err = relay
            .forward_from(anonymous.link.id(), decline("x", "patient"))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotRegistered(anonymous.link.id()));
    }
}
