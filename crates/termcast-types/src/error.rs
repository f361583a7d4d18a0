use serde::Serialize;

/// The error taxonomy surfaced across every component, mapped to an HTTP
/// status (or a WebSocket close reason) at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    NotFound,
    InvalidRequest,
    Unauthorized,
    SpawnFailed,
    SessionGone,
    SlowConsumer,
    RemoteUnavailable,
    Conflict,
    Internal,
}

impl Kind {
    pub fn http_status(self) -> u16 {
        match self {
            Kind::NotFound => 404,
            Kind::InvalidRequest => 400,
            Kind::Unauthorized => 401,
            Kind::SpawnFailed => 500,
            Kind::SessionGone => 409,
            Kind::SlowConsumer => 499,
            Kind::RemoteUnavailable => 503,
            Kind::Conflict => 409,
            Kind::Internal => 500,
        }
    }
}

/// A typed error carrying both a human-readable cause and a [`Kind`] for
/// transport-layer status mapping. Every component error converts into
/// this via `From` so `termcast-server` has one place that maps kind to
/// HTTP status.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CoreError {
    pub kind: Kind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidRequest, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: Kind,
}

impl From<&CoreError> for ErrorBody {
    fn from(e: &CoreError) -> Self {
        Self {
            error: e.message.clone(),
            kind: e.kind,
        }
    }
}
