use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use termcast_types::{CoreError, Kind, SessionDescriptor, SessionSummary, SpawnSource, TitleMode};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_sessions).post(create_session))
        .route("/{id}", get(get_session).patch(rename_session).delete(delete_session))
        .route("/{id}/input", post(send_input))
        .route("/{id}/resize", post(resize_session))
        .route("/{id}/stream", get(stream_session))
        .route("/{id}/notifications", get(stream_notifications))
}

/// Looks up which remote owns `id`, consulting the federation cache and,
/// on a miss, refreshing it with a fresh remote session listing (§4.H:
/// "session-scoped requests routed by remoteId"). Returns `None` on a
/// plain Remote/standalone node (`state.federation` is `None`) or when
/// no registered remote claims this id, meaning it is local.
async fn locate_remote(state: &AppState, id: &str) -> Option<String> {
    let federation = state.federation.as_ref()?;
    if let Some(remote_id) = federation.locate_session(id) {
        return Some(remote_id);
    }
    federation.list_remote_sessions().await;
    federation.locate_session(id)
}

async fn proxy_json<T: DeserializeOwned>(
    state: &AppState,
    remote_id: &str,
    method: reqwest::Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<T, ApiError> {
    let federation = state.federation.as_ref().expect("proxy_json requires federation");
    let resp = federation
        .proxy_request(remote_id, method, path, body)
        .await
        .map_err(CoreError::from)?;
    let resp = resp
        .error_for_status()
        .map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
    resp.json::<T>()
        .await
        .map_err(|e| CoreError::new(Kind::Internal, e.to_string()).into())
}

async fn proxy_status(
    state: &AppState,
    remote_id: &str,
    method: reqwest::Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<StatusCode, ApiError> {
    let federation = state.federation.as_ref().expect("proxy_status requires federation");
    let resp = federation
        .proxy_request(remote_id, method, path, body)
        .await
        .map_err(CoreError::from)?;
    Ok(StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
}

#[derive(Debug, Deserialize, Serialize)]
struct CreateSessionRequest {
    command: Vec<String>,
    #[serde(rename = "workingDir")]
    working_dir: Option<String>,
    name: Option<String>,
    rows: Option<u16>,
    cols: Option<u16>,
    #[serde(rename = "titleMode")]
    title_mode: Option<TitleMode>,
    #[serde(rename = "spawnTerminal")]
    spawn_terminal: Option<bool>,
    #[serde(rename = "gitRepoPath")]
    git_repo_path: Option<String>,
    #[serde(rename = "gitBranch")]
    git_branch: Option<String>,
    #[serde(rename = "remoteId")]
    remote_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    if req.command.is_empty() {
        return Err(CoreError::invalid("command must not be empty").into());
    }

    // §4.H: a session created with `remoteId` set is created on that
    // Remote, which is authoritative — the HQ never spawns it locally.
    if let Some(remote_id) = req.remote_id.clone() {
        if state.federation.is_some() {
            let body = serde_json::to_vec(&req)
                .map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
            let created: CreateSessionResponse = proxy_json(
                &state,
                &remote_id,
                reqwest::Method::POST,
                "/api/sessions",
                Some(body),
            )
            .await?;
            state
                .federation
                .as_ref()
                .unwrap()
                .remember_session(created.session_id.clone(), remote_id);
            return Ok(Json(created));
        }
    }

    let rows = req.rows.unwrap_or(state.config.default_rows);
    let cols = req.cols.unwrap_or(state.config.default_cols);
    let descriptor = SessionDescriptor {
        command: req.command,
        working_dir: req
            .working_dir
            .unwrap_or_else(|| state.config.data_dir.to_string_lossy().into_owned()),
        env: HashMap::new(),
        rows,
        cols,
        name: req.name,
        title_mode: req.title_mode.unwrap_or_default(),
        spawn_source: if req.spawn_terminal.unwrap_or(false) {
            SpawnSource::ExternalTerminal
        } else {
            SpawnSource::Web
        },
        git_repo_path: req.git_repo_path,
        git_branch: req.git_branch,
        remote_id: req.remote_id,
    };

    let session_id = state
        .registry
        .create(descriptor)
        .await
        .map_err(CoreError::from)?;

    state
        .renderer
        .attach(&session_id, rows, cols)
        .map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;

    Ok(Json(CreateSessionResponse { session_id }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let mut sessions = state.registry.list().await;
    if let Some(federation) = &state.federation {
        sessions.extend(federation.list_remote_sessions().await);
    }
    Json(sessions)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let summary: SessionSummary = proxy_json(
            &state,
            &remote_id,
            reqwest::Method::GET,
            &format!("/api/sessions/{id}"),
            None,
        )
        .await?;
        return Ok(Json(summary));
    }
    Ok(Json(state.registry.get(&id).await.map_err(CoreError::from)?))
}

#[derive(Debug, Deserialize, Serialize)]
struct RenameRequest {
    name: String,
}

async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let body =
            serde_json::to_vec(&req).map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
        return proxy_status(
            &state,
            &remote_id,
            reqwest::Method::PATCH,
            &format!("/api/sessions/{id}"),
            Some(body),
        )
        .await;
    }
    state.control.rename(&id, req.name).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let path = if query.force {
            format!("/api/sessions/{id}?force=true")
        } else {
            format!("/api/sessions/{id}")
        };
        return proxy_status(&state, &remote_id, reqwest::Method::DELETE, &path, None).await;
    }
    state
        .registry
        .delete(&id, query.force)
        .await
        .map_err(CoreError::from)?;
    state.watcher.forget(&id);
    state.renderer.detach(&id);
    Ok(if query.force {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    })
}

#[derive(Debug, Deserialize, Serialize)]
struct InputRequest {
    text: Option<String>,
    key: Option<String>,
}

async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<StatusCode, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let body =
            serde_json::to_vec(&req).map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
        return proxy_status(
            &state,
            &remote_id,
            reqwest::Method::POST,
            &format!("/api/sessions/{id}/input"),
            Some(body),
        )
        .await;
    }
    if let Some(text) = req.text {
        state.control.input(&id, text.as_bytes()).await?;
    } else if let Some(key) = req.key {
        state.control.input_key(&id, &key).await?;
    } else {
        return Err(CoreError::invalid("input requires either `text` or `key`").into());
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, Serialize)]
struct ResizeRequest {
    rows: u16,
    cols: u16,
}

async fn resize_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<StatusCode, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let body =
            serde_json::to_vec(&req).map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
        return proxy_status(
            &state,
            &remote_id,
            reqwest::Method::POST,
            &format!("/api/sessions/{id}/resize"),
            Some(body),
        )
        .await;
    }
    state.control.resize(&id, req.rows, req.cols).await?;
    if let Err(e) = state.renderer.resize(&id, req.rows, req.cols).await {
        warn!(session = %id, error = %e, "renderer resize failed");
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SseFrame {
    Header(termcast_types::RecordingHeader),
    Event { t: f64, kind: String, data: String },
    Exit { code: Option<i32> },
}

/// `GET /api/sessions/:id/stream` (§6): a backfill block followed by
/// live events, terminating with a final `exit` event on session exit.
/// A session owned by a remote is proxied byte-for-byte (§4.H) instead
/// of being re-decoded into `SseFrame`s.
async fn stream_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    if let Some(remote_id) = locate_remote(&state, &id).await {
        let federation = state.federation.as_ref().expect("locate_remote implies federation");
        let resp = federation
            .proxy_request(
                &remote_id,
                reqwest::Method::GET,
                &format!("/api/sessions/{id}/stream"),
                None,
            )
            .await
            .map_err(CoreError::from)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| "text/event-stream".parse().unwrap());
        let body = Body::from_stream(resp.bytes_stream());
        let response = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .map_err(|e| CoreError::new(Kind::Internal, e.to_string()))?;
        return Ok(response);
    }

    let mut sub = state
        .watcher
        .subscribe(&id, state.config.subscriber_queue_capacity)
        .await
        .map_err(|e| CoreError::new(Kind::NotFound, e.to_string()))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        while let Some(msg) = sub.rx.recv().await {
            let frame = match msg {
                termcast_watcher::WatchMessage::Header(h) => SseFrame::Header(h),
                termcast_watcher::WatchMessage::SyntheticClear => SseFrame::Event {
                    t: 0.0,
                    kind: "o".into(),
                    data: "\u{1b}[2J\u{1b}[H".into(),
                },
                termcast_watcher::WatchMessage::Event(e) => SseFrame::Event {
                    t: e.elapsed_seconds,
                    kind: e.kind.tag().to_string(),
                    data: e.payload,
                },
                termcast_watcher::WatchMessage::Disconnected(reason) => {
                    // A slow consumer is dropped silently (it will retry
                    // the connection); only a closed session gets a
                    // final `exit` frame, since only that reason means
                    // the PTY itself is gone.
                    if reason == termcast_watcher::DisconnectReason::SessionClosed {
                        let code = state
                            .registry
                            .get(&id)
                            .await
                            .ok()
                            .and_then(|s| s.exit_code);
                        if let Ok(event) = Event::default().json_data(&SseFrame::Exit { code }) {
                            let _ = tx.send(Ok(event)).await;
                        }
                    }
                    break;
                }
            };
            let event = match Event::default().json_data(&frame) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut file = state
        .recordings
        .open_notifications(&id)
        .await
        .map_err(|e| CoreError::new(Kind::NotFound, e.to_string()))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut reader = BufReader::new(&mut file);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Ok(_) => {
                    if let Ok(event) = Event::default().json_data(line.trim_end()) {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}
