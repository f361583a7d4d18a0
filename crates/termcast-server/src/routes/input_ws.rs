//! `WS /ws/input?sessionId=` (§4.G): bidirectional text frames carrying
//! keystrokes; the server pushes a resize acknowledgement after each
//! accepted resize.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/input", get(upgrade))
}

#[derive(Debug, Deserialize)]
struct InputQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientFrame {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ServerFrame {
    Resized { rows: u16, cols: u16 },
    Error { message: String },
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InputQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state, query.session_id))
}

async fn handle(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Input { data }) => {
                if let Err(e) = state.control.input(&session_id, data.as_bytes()).await {
                    let _ = send_json(
                        &mut socket,
                        &ServerFrame::Error { message: e.message },
                    )
                    .await;
                }
            }
            Ok(ClientFrame::Resize { rows, cols }) => match state.control.resize(&session_id, rows, cols).await {
                Ok(()) => {
                    let _ = state.renderer.resize(&session_id, rows, cols).await;
                    let _ = send_json(&mut socket, &ServerFrame::Resized { rows, cols }).await;
                }
                Err(e) => {
                    let _ = send_json(&mut socket, &ServerFrame::Error { message: e.message }).await;
                }
            },
            Err(e) => debug!(error = %e, "malformed input ws frame"),
        }
    }
}

async fn send_json(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
