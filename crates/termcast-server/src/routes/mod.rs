pub mod buffers;
pub mod input_ws;
pub mod remotes;
pub mod sessions;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Top-level route tree: one `nest()` per resource group.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/api/sessions", sessions::router())
        .nest("/api/remotes", remotes::router())
        .merge(buffers::router())
        .merge(input_ws::router())
}
