//! WebSocket event stream: server-to-client envelopes for one session.
//!
//! On disconnect the session's cancel flag is set so an abandoned
//! deliberation does not keep burning provider quota.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if !state.session_manager.exists(&id).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    info!(session_id = %session_id, "ws.connected");
    let subscription = state.broadcaster.subscribe(&session_id).await;
    let (mut tx, mut rx) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it.
    ping.tick().await;

    let mut client_gone = false;
    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                match envelope {
                    Some(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "ws.serialize_failed");
                                continue;
                            }
                        };
                        if tx.send(WsMessage::Text(text.into())).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    // Stream closed: the session reached a terminal state.
                    None => break,
                }
            }
            _ = ping.tick() => {
                if tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        client_gone = true;
                        break;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        debug!(session_id = %session_id, "ws.pong");
                    }
                    Some(Ok(_)) => {
                        // Server-to-client stream only; inbound frames are
                        // ignored.
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&subscription).await;
    if client_gone {
        info!(session_id = %session_id, "ws.disconnected; cancelling session");
        state.session_manager.cancel_on_disconnect(&session_id).await;
    } else {
        let _ = tx.send(WsMessage::Close(None)).await;
        info!(session_id = %session_id, "ws.stream_complete");
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/sessions/{id}", get(ws_session))
        .with_state(state)
}
