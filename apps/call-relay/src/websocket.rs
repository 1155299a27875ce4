use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use call_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::{
    registry::{LinkFrame, TransportLink},
    relay::RelayError,
    AppState,
};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let channel = state.registry.open_link();
    let link = channel.link;
    let mut rx = channel.receiver;
    let link_id = link.id();
    let (mut sender, mut receiver) = socket.split();

    gauge!("call_relay_links_open").increment(1.0);
    counter!("call_relay_links_opened_total").increment(1);
    debug!(%link_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                LinkFrame::Message(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                LinkFrame::Close { reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: axum::extract::ws::close_code::AWAY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(%link_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%link_id, error = %err, "websocket receive failed");
                break;
            }
        };

        let parsed = match frame {
            Message::Text(text) => serde_json::from_str::<ClientMessage>(&text),
            Message::Binary(bytes) => serde_json::from_slice::<ClientMessage>(&bytes),
            Message::Close(frame) => {
                debug!(
                    %link_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                state.registry.touch(link_id).await;
                continue;
            }
        };

        match parsed {
            Ok(message) => handle_client_message(&state, &link, message).await,
            Err(err) => {
                counter!("call_relay_invalid_messages_total").increment(1);
                warn!(%link_id, error = %err, "invalid client message");
                reply(
                    &link,
                    ServerMessage::Error {
                        message: format!("invalid message format: {err}"),
                    },
                );
            }
        }
    }

    if let Some(outcome) = state.registry.leave(link_id).await {
        info!(
            %link_id,
            participant_id = %outcome.participant_id,
            remaining = outcome.remaining,
            "link left"
        );
    }
    gauge!("call_relay_links_open").decrement(1.0);
    writer.abort();
}

async fn handle_client_message(state: &AppState, link: &TransportLink, message: ClientMessage) {
    let link_id = link.id();
    match message {
        ClientMessage::Register { participant_id } => {
            if participant_id.is_empty() {
                reply(
                    link,
                    ServerMessage::Error {
                        message: "participant_id must not be empty".into(),
                    },
                );
                return;
            }
            let outcome = state.registry.join(&participant_id, link).await;
            if !outcome.duplicate {
                info!(
                    %link_id,
                    %participant_id,
                    links = outcome.links,
                    "link registered"
                );
            }
            reply(
                link,
                ServerMessage::Registered {
                    participant_id,
                    links: outcome.links,
                },
            );
        }
        ClientMessage::Signal { envelope } => {
            state.registry.touch(link_id).await;
            match state.relay.forward_from(link_id, envelope).await {
                Ok(_) => {}
                Err(err @ RelayError::NotRegistered(_)) => {
                    debug!(%link_id, "signal before register");
                    reply(
                        link,
                        ServerMessage::Error {
                            message: err.to_string(),
                        },
                    );
                }
                Err(err) => {
                    counter!("call_relay_invalid_messages_total").increment(1);
                    warn!(%link_id, error = %err, "rejected envelope");
                    reply(
                        link,
                        ServerMessage::Error {
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
        ClientMessage::Ping => {
            state.registry.touch(link_id).await;
            reply(link, ServerMessage::Pong);
        }
    }
}

fn reply(link: &TransportLink, message: ServerMessage) {
    if !link.try_send(LinkFrame::Message(message)) {
        debug!(link_id = %link.id(), "reply dropped; link buffer unavailable");
    }
}
