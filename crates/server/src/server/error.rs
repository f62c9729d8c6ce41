//! Errors raised by route handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::protocol::ErrorResponse;
use thiserror::Error;
use tracing::warn;

/// Failure inside request-processing logic.
///
/// Converted into a JSON error response; the request's `"after"` event
/// still fires and carries the resulting status.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// The HTTP status sent for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::NotFound(_) => StatusCode::NOT_FOUND,
            HandlerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            HandlerError::BadRequest(_) => "bad_request",
            HandlerError::NotFound(_) => "not_found",
            HandlerError::Unavailable(_) => "service_unavailable",
            HandlerError::Internal(_) => "internal_error",
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Internal(e.to_string())
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "handler failed");
        }
        (status, Json(ErrorResponse::new(self.code(), self.to_string()))).into_response()
    }
}
