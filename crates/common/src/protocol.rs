//! Wire and record types exchanged between components.
//!
//! These types are serialised as JSON both on the public HTTP surface and in
//! the audit log stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Audit record
// ---------------------------------------------------------------------------

/// One structured audit entry summarising a request/response pair.
///
/// Optional fields are omitted from the serialised form when absent, so a
/// record built without body capture never carries `requestBody` or
/// `responseBody` keys at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Lifecycle event that produced this record (e.g. `"after"`).
    pub event: String,
    /// Per-request identifier.
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    /// Milliseconds between request start and response finalisation.
    pub duration_ms: u64,
    /// Negotiated HTTP version, e.g. `"HTTP/2.0"`.
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    /// Wall-clock time the request was received, in UNIX milliseconds.
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
}

/// Render captured body bytes for an audit record.
///
/// JSON bodies are embedded as structured values; anything else is recorded
/// as a (lossily decoded) UTF-8 string. An absent body renders as `""`.
pub fn body_value(body: Option<&Bytes>) -> serde_json::Value {
    match body {
        None => serde_json::Value::String(String::new()),
        Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }),
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

/// Response body for `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub hello: String,
}

impl Default for HelloResponse {
    fn default() -> Self {
        Self {
            hello: "world".into(),
        }
    }
}

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"not_found"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
