use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use super::AppState;
use crate::types::ServerFrame;

/// Close code sent for sessions the server does not know.
pub const UNKNOWN_SESSION_CLOSE: u16 = 4004;

pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(mut socket: WebSocket, session_id: String, state: AppState) {
    if !state.sessions.contains(&session_id) {
        tracing::info!(%session_id, "rejecting WebSocket for unknown session");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: UNKNOWN_SESSION_CLOSE,
                reason: "Invalid session ID".into(),
            })))
            .await;
        return;
    }

    let (client_id, mut frames) = state.hub.register(&session_id);
    tracing::info!(%session_id, %client_id, "WebSocket connected");
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to encode frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        // Replaced by a newer socket, or the hub went away.
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) if text.trim() == "ping" => {
                state.hub.send(&session_id, ServerFrame::Pong);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.hub.unregister(&session_id, client_id);
    writer.abort();
    tracing::info!(%session_id, %client_id, "WebSocket disconnected");
}
