use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use call_proto::{ClientMessage, Envelope, ParticipantId, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::error::SignalingError;

/// Outbound half of a signaling connection as seen by the call driver.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

/// A registered connection to the signaling relay.
///
/// Dropping the client (or calling [`SignalingClient::close`]) stops its
/// reader, writer and heartbeat tasks.
pub struct SignalingClient {
    participant_id: ParticipantId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

type RegistrationResult = Result<usize, String>;

impl SignalingClient {
    /// Connects to the relay and registers `participant_id`. Resolves once the
    /// relay acknowledges the registration.
    pub async fn connect(
        relay_url: &str,
        participant_id: ParticipantId,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, SignalingError> {
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (registered_tx, registered_rx) = oneshot::channel::<RegistrationResult>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader_connected = Arc::clone(&connected);
        let reader_participant = participant_id.clone();
        let reader_handle = tokio::spawn(async move {
            let mut registered_tx = Some(registered_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                };

                let message = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "unparseable relay message");
                        continue;
                    }
                };
                match message {
                    ServerMessage::Registered {
                        participant_id,
                        links,
                    } => {
                        tracing::debug!(
                            target = "signaling",
                            %participant_id,
                            links,
                            "registered with relay"
                        );
                        if let Some(tx) = registered_tx.take() {
                            let _ = tx.send(Ok(links));
                        }
                    }
                    ServerMessage::Signal { envelope } => {
                        if envelope.to != reader_participant {
                            tracing::debug!(
                                target = "signaling",
                                to = %envelope.to,
                                "dropping envelope for another participant"
                            );
                            continue;
                        }
                        if inbound_tx.send(envelope).is_err() {
                            tracing::debug!(target = "signaling", "inbound receiver dropped");
                        }
                    }
                    ServerMessage::Pong => {
                        tracing::trace!(target = "signaling", "pong");
                    }
                    ServerMessage::Error { message } => match registered_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(message));
                        }
                        None => {
                            tracing::warn!(target = "signaling", %message, "relay reported error")
                        }
                    },
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Arc::new(SignalingClient {
            participant_id: participant_id.clone(),
            send_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            connected,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        });

        client
            .send_tx
            .send(ClientMessage::Register {
                participant_id: participant_id.clone(),
            })
            .map_err(|_| SignalingError::Closed)?;
        tracing::debug!(target = "signaling", %participant_id, "sent register");

        match registered_rx.await {
            Ok(Ok(_)) => Ok(client),
            Ok(Err(reason)) => Err(SignalingError::Rejected(reason)),
            Err(_) => Err(SignalingError::Closed),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hands out the stream of envelopes addressed to this participant. Only
    /// the first call returns it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound_rx.lock().take()
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        self.send_tx
            .send(ClientMessage::Signal { envelope })
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepts `http(s)` or `ws(s)` relay addresses; a bare host gets the `/ws`
/// route appended.
fn derive_websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: &str| SignalingError::InvalidUrl {
        url: relay_url.to_string(),
        reason: reason.to_string(),
    };
    let base = Url::parse(relay_url).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(invalid("unsupported scheme")),
    };

    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme"))?;
    if ws.path().is_empty() || ws.path() == "/" {
        ws.set_path("/ws");
    }
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn http_urls_become_websocket_urls() {
        let url = derive_websocket_url("http://relay.local:8090").unwrap();
        assert_eq!(url.as_str(), "ws://relay.local:8090/ws");

        let url = derive_websocket_url("https://relay.example.org/").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.org/ws");
    }

    #[test_timeout::timeout]
    fn explicit_paths_are_kept() {
        let url = derive_websocket_url("ws://127.0.0.1:9000/signal").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/signal");
    }

    #[test_timeout::timeout]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            derive_websocket_url("ftp://relay"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(derive_websocket_url("not a url").is_err());
    }
}
