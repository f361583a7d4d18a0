//! Federation endpoints (§4.H, §6), only meaningful when this node runs
//! as an HQ (`state.federation` is `Some`).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use termcast_federation::{RemoteDescriptor, RemoteStatus};
use termcast_types::{CoreError, Kind};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register_remote))
        .route("/", get(list_remotes))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    id: String,
    name: String,
    url: String,
    token: String,
}

async fn register_remote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<StatusCode, ApiError> {
    let federation = state
        .federation
        .as_ref()
        .ok_or_else(|| CoreError::new(Kind::InvalidRequest, "this node is not an HQ"))?;

    federation.register(RemoteDescriptor {
        id: req.id,
        name: req.name,
        public_url: req.url,
        bearer_token: req.token,
    });
    Ok(StatusCode::OK)
}

async fn list_remotes(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RemoteStatus>>, ApiError> {
    let federation = state
        .federation
        .as_ref()
        .ok_or_else(|| CoreError::new(Kind::InvalidRequest, "this node is not an HQ"))?;
    Ok(Json(federation.list_remotes()))
}
