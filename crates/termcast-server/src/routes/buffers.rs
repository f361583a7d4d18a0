//! `WS /buffers` (§4.G): a single connection multiplexes binary cell
//! snapshots for any number of sessions. Each outbound frame is tagged
//! with the session id it belongs to via a one-byte length prefix,
//! since §4.E only specifies the per-session snapshot payload, not how
//! a shared socket distinguishes sessions.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/buffers", get(upgrade))
}

async fn upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ControlFrame {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping,
}

fn tag_frame(session_id: &str, payload: Bytes) -> Bytes {
    let id = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(1 + id.len() + payload.len());
    buf.put_u8(id.len() as u8);
    buf.put_slice(id);
    buf.put_slice(&payload);
    buf.freeze()
}

async fn handle(mut socket: WebSocket, state: Arc<AppState>) {
    let (tagged_tx, mut tagged_rx) = mpsc::channel::<Bytes>(64);
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            Some(frame) = tagged_rx.recv() => {
                if socket.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(ControlFrame::Subscribe { session_id }) => {
                                if subscriptions.contains_key(&session_id) {
                                    continue;
                                }
                                match state.renderer.subscribe(&session_id).await {
                                    Ok((snapshot, mut rx)) => {
                                        let _ = tagged_tx.send(tag_frame(&session_id, snapshot)).await;
                                        let tx = tagged_tx.clone();
                                        let id = session_id.clone();
                                        let handle = tokio::spawn(async move {
                                            loop {
                                                match rx.recv().await {
                                                    Ok(frame) => {
                                                        if tx.send(tag_frame(&id, frame)).await.is_err() {
                                                            break;
                                                        }
                                                    }
                                                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                                }
                                            }
                                        });
                                        subscriptions.insert(session_id, handle);
                                    }
                                    Err(e) => debug!(session = %session_id, error = %e, "subscribe to buffers failed"),
                                }
                            }
                            Ok(ControlFrame::Unsubscribe { session_id }) => {
                                if let Some(handle) = subscriptions.remove(&session_id) {
                                    handle.abort();
                                }
                            }
                            Ok(ControlFrame::Ping) => {
                                let _ = socket.send(Message::Text(r#"{"op":"pong"}"#.into())).await;
                            }
                            Err(e) => debug!(error = %e, "malformed buffers control frame"),
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_frame_carries_a_length_prefixed_session_id() {
        let payload = Bytes::from_static(b"VTCB\x01");
        let frame = tag_frame("sess_abc", payload.clone());

        let id_len = frame[0] as usize;
        assert_eq!(id_len, "sess_abc".len());
        assert_eq!(&frame[1..1 + id_len], b"sess_abc");
        assert_eq!(&frame[1 + id_len..], &payload[..]);
    }

    #[test]
    fn subscribe_control_frame_parses_camelcase_session_id() {
        let frame: ControlFrame = serde_json::from_str(r#"{"op":"subscribe","sessionId":"s1"}"#).unwrap();
        assert!(matches!(frame, ControlFrame::Subscribe { session_id } if session_id == "s1"));
    }
}
