//! Per-request context carried through the lifecycle.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use axum::http::{HeaderMap, Method, StatusCode, Version};
use bytes::Bytes;
use uuid::Uuid;

/// Fired once per request after the response has been finalised.
pub const AFTER: &str = "after";

/// Every event name the lifecycle middleware emits.
pub const EVENTS: &[&str] = &[AFTER];

/// Non-standard status recorded when the client went away before the
/// response was complete.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Request side of one in-flight request.
///
/// Owned by the task serving the request and dropped once its `"after"`
/// event has been dispatched.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Captured request body; `None` when the request carried no bytes.
    pub body: Option<Bytes>,
    pub version: Version,
    pub remote_addr: Option<SocketAddr>,
    pub start_time: Instant,
    /// Wall-clock counterpart of `start_time`, for log timestamps.
    pub received_at: SystemTime,
}

/// Response side of one request, paired with its [`RequestContext`].
#[derive(Debug)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub end_time: Instant,
}

impl ResponseContext {
    /// Context describing a request abandoned by the client.
    pub fn client_closed(end_time: Instant) -> Self {
        Self {
            status: client_closed_status(),
            headers: HeaderMap::new(),
            body: None,
            end_time,
        }
    }
}

pub(crate) fn client_closed_status() -> StatusCode {
    StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
}

/// A named lifecycle notification with read-only views of both contexts.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleEvent<'a> {
    pub name: &'a str,
    pub request: &'a RequestContext,
    pub response: &'a ResponseContext,
}

impl LifecycleEvent<'_> {
    /// Time between request start and response finalisation.
    pub fn duration(&self) -> Duration {
        let elapsed = self
            .response
            .end_time
            .checked_duration_since(self.request.start_time);
        debug_assert!(elapsed.is_some(), "response finished before request started");
        elapsed.unwrap_or_default()
    }
}
