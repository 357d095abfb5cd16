//! API error taxonomy shared by every HTTP handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced to clients, mapped onto HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("peer not authorised")]
    AuthDenied,
    #[error("{0}")]
    BadRequest(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("duplicate submission within cooldown window")]
    Cooldown { cooldown_ms: u64 },
    #[error("a turn is already in flight")]
    Busy,
    #[error("{0}")]
    Unavailable(String),
    #[error("timed out")]
    Timeout,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("speech service returned {status}")]
    UpstreamSpeech { status: u16, body: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable error code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthDenied => "auth_denied",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::Cooldown { .. } => "cooldown",
            ApiError::Busy => "busy",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Timeout => "timeout",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::UpstreamSpeech { .. } => "upstream",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthDenied => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpstreamSpeech { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!("internal error: {:#}", err);
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        match &self {
            ApiError::Cooldown { cooldown_ms } => {
                body["cooldown_ms"] = json!(cooldown_ms);
            }
            ApiError::UpstreamSpeech { status, body: upstream } => {
                body["upstream_status"] = json!(status);
                body["upstream_body"] = json!(upstream);
            }
            _ => {}
        }

        (self.status(), Json(body)).into_response()
    }
}
