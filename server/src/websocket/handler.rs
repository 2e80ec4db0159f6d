//! WebSocket connection handling.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use super::{ClientMessage, ServerMessage};
use crate::AppState;

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Serve one status stream connection until the client goes away.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = uuid::Uuid::new_v4();
    tracing::info!(conn_id = %conn_id, "status stream connected");

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize WebSocket message: {}", e),
            }
        }
    });

    // Forward session reports as they are published
    let mut updates = state.board.subscribe();
    let update_tx = tx.clone();
    let update_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(status) => {
                    if update_tx.send(ServerMessage::SessionUpdate { status }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "status stream fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let _ = tx.send(ServerMessage::Sessions {
        sessions: state.board.sessions(),
        request_id: None,
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let _ = tx.send(process_message(&text, &state));
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    update_task.abort();
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "status stream disconnected");
}

fn process_message(text: &str, state: &AppState) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return ServerMessage::error(format!("Invalid message format: {}", e), None),
    };

    match client_msg {
        ClientMessage::Sessions { request_id } => ServerMessage::Sessions {
            sessions: state.board.sessions(),
            request_id,
        },
        ClientMessage::Conflicts {
            session_id,
            request_id,
        } => match state.orchestrator.conflict_manager() {
            Ok(manager) => ServerMessage::Conflicts {
                conflicts: manager.unresolved_conflicts(session_id),
                request_id,
            },
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },
        ClientMessage::Ping => ServerMessage::Pong,
    }
}
