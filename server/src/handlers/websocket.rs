//! WebSocket handler for call signaling relay

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{crypto, models::*, AppState};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WsServerMessage>();

    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut user_id: Option<String> = None;

    // Task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let max_signal_bytes = state.config.max_signal_bytes();

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if text.len() > max_signal_bytes {
                    let _ = tx.send(WsServerMessage::error(
                        "PAYLOAD_TOO_LARGE",
                        format!("Messages are limited to {} bytes", max_signal_bytes),
                    ));
                    continue;
                }

                match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(WsClientMessage::Authenticate { token }) => {
                        match crypto::verify_token(&token, &state.config.auth.token_secret) {
                            Some(uid) => {
                                state.ws_manager.register(&uid, &connection_id, tx.clone());
                                let _ = tx.send(WsServerMessage::Authenticated {
                                    user_id: uid.clone(),
                                });
                                tracing::info!("WebSocket authenticated: user={}", uid);
                                user_id = Some(uid);
                            }
                            None => {
                                let _ = tx.send(WsServerMessage::error(
                                    "AUTH_FAILED",
                                    "Invalid or expired token",
                                ));
                            }
                        }
                    }

                    Ok(WsClientMessage::Signal(envelope)) => {
                        let Some(ref uid) = user_id else {
                            let _ = tx.send(WsServerMessage::error(
                                "UNAUTHENTICATED",
                                "Authenticate before signaling",
                            ));
                            continue;
                        };

                        if let Some(error) = relay_signal(&state, uid, envelope) {
                            let _ = tx.send(error);
                        }
                    }

                    Ok(WsClientMessage::Ping) => {
                        let _ = tx.send(WsServerMessage::Pong);
                    }

                    Err(e) => {
                        tracing::warn!("Failed to parse WebSocket message: {}", e);
                        let _ = tx.send(WsServerMessage::error(
                            "PARSE_ERROR",
                            format!("Invalid message format: {}", e),
                        ));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                // Binary messages not supported
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Handled by the WebSocket library
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup
    state.ws_manager.unregister(&connection_id);
    send_task.abort();
}

/// Forward one signal to its recipient. Returns the error to report back to
/// the sender, if any.
fn relay_signal(state: &AppState, sender_id: &str, mut envelope: SignalEnvelope) -> Option<WsServerMessage> {
    if !envelope.sender_matches(sender_id) {
        tracing::warn!(
            "Rejected {:?} from {} claiming to be {:?}",
            envelope.kind,
            sender_id,
            envelope.claimed_sender()
        );
        return Some(WsServerMessage::error("INVALID_SENDER", "Sender ID mismatch"));
    }

    if envelope.to == sender_id {
        return Some(WsServerMessage::error("INVALID_RECIPIENT", "Cannot signal yourself"));
    }

    envelope.sender = Some(sender_id.to_string());

    let recipient = envelope.to.clone();
    let kind = envelope.kind;
    let call_id = envelope.call_id.clone();

    if state.ws_manager.send_to_user(&recipient, WsServerMessage::Signal(envelope)) == 0 {
        tracing::debug!("Dropping {:?} for call {}: {} is offline", kind, call_id, recipient);
        return Some(WsServerMessage::error(
            "RECIPIENT_OFFLINE",
            format!("{} is not connected", recipient),
        ));
    }

    tracing::debug!("Relayed {:?} for call {}: {} -> {}", kind, call_id, sender_id, recipient);
    None
}
