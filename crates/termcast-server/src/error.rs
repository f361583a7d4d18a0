use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use termcast_types::{CoreError, ErrorBody};

/// Wraps [`CoreError`] so it can be returned directly from axum handlers;
/// the status comes from `Kind::http_status()` (§7's kind → status table)
/// so every component's errors land on the same mapping.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::from(&self.0);
        (status, Json(body)).into_response()
    }
}
