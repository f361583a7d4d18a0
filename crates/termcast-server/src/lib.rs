//! Transport Layer (§4.G): a thin axum mapping from HTTP/SSE/WS onto the
//! components above. Connection lifecycle (SSE backfill-then-tail,
//! WebSocket multiplexing) is the only non-trivial responsibility here.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

fn is_allowed_origin(origin: &str) -> bool {
    origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin.to_str().map(is_allowed_origin).unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    routes::router()
        .route("/api/health", get(health))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use termcast_config::Config;
    use termcast_pty::PtySupervisor;
    use termcast_recording::RecordingStore;
    use termcast_registry::SessionRegistry;
    use termcast_renderer::TerminalRenderer;
    use termcast_watcher::StreamWatcher;
    use tower::util::ServiceExt;

    fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let config = Arc::new(Config {
            data_dir: dir.to_path_buf(),
            verbosity: termcast_util::Verbosity::Info,
            debug_mode: false,
            default_rows: 24,
            default_cols: 80,
            kill_grace_period: std::time::Duration::from_secs(3),
            subscriber_queue_capacity: 64,
        });
        let recordings = RecordingStore::new(config.data_dir.clone());
        let supervisor = PtySupervisor::new();
        let registry = SessionRegistry::new(config.clone(), recordings.clone(), supervisor.clone());
        let watcher = StreamWatcher::new(recordings.clone());
        let renderer = TerminalRenderer::new(supervisor);
        AppState::new(config, registry, watcher, renderer, recordings, None)
    }

    #[tokio::test]
    async fn stream_endpoint_opens_an_event_stream_and_delivers_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = build_router(state.clone());

        let create = serde_json::json!({ "command": ["/bin/cat"] });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&create).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["sessionId"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/api/sessions/{id}/stream"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));

        // The stream stays open past the header (it tails the recording
        // for live growth), so read only the first chunk rather than
        // waiting for the body to close.
        let mut stream = resp.into_body().into_data_stream();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for the header frame")
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("\"header\""));

        state.registry.delete(&id, true).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_stream_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/sessions/ghost/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
