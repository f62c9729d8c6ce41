//! Built-in request handlers.

use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::protocol::{ErrorResponse, HelloResponse};
use tracing::error;

/// `GET /`: responds with `{"hello":"world"}`.
pub async fn hello() -> Json<HelloResponse> {
    Json(HelloResponse::default())
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

/// Response sent when a handler panics.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    error!(panic = %detail, "handler panicked");
    let err = ErrorResponse::new("internal_error", "the request handler failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response()
}
