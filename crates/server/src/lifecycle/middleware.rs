//! Axum middleware that builds request/response contexts and fires `"after"`.
//!
//! The event is emitted when hyper is done with the response body: either the
//! final frame was handed to the connection, or the body was dropped early
//! because the client went away (recorded as status 499). If the request
//! future itself is dropped mid-handler, the pending event fires from its
//! destructor with the same client-closed status.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{request, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use common::protocol::ErrorResponse;
use http_body::{Body as _, Frame, SizeHint};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::EventBus;
use super::context::{RequestContext, ResponseContext, AFTER};
use crate::net::ConnectionInfo;

/// State shared by every invocation of [`track`].
#[derive(Clone, Debug)]
pub struct LifecycleState {
    pub bus: EventBus,
    pub max_body_bytes: usize,
}

/// Capture the request, run the inner service, and arrange for `"after"` to
/// fire exactly once for this request.
pub async fn track(State(state): State<LifecycleState>, req: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let received_at = SystemTime::now();
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            let ctx = request_context(&parts, None, start_time, received_at);
            let pending = PendingEvent::new(state.bus, ctx);
            let response = (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse::new(
                    "payload_too_large",
                    format!("request body exceeds {} bytes", state.max_body_bytes),
                )),
            )
                .into_response();
            return finish(pending, response).await;
        }
        Err(e) => {
            // No request context exists yet, so no lifecycle event is due.
            debug!(error = %e, "request body could not be read");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let captured = (!body.is_empty()).then(|| body.clone());
    let ctx = request_context(&parts, captured, start_time, received_at);
    let pending = PendingEvent::new(state.bus, ctx);

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    finish(pending, response).await
}

fn request_context(
    parts: &request::Parts,
    body: Option<Bytes>,
    start_time: Instant,
    received_at: SystemTime,
) -> RequestContext {
    RequestContext {
        request_id: Uuid::new_v4(),
        method: parts.method.clone(),
        path: parts.uri.path().to_owned(),
        headers: parts.headers.clone(),
        body,
        version: parts.version,
        remote_addr: parts
            .extensions
            .get::<ConnectionInfo>()
            .map(|info| info.remote_addr),
        start_time,
        received_at,
    }
}

/// Buffer the response and wrap its body so completion fires the event.
async fn finish(pending: PendingEvent, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response body failed; replacing with 500");
            parts.status = StatusCode::INTERNAL_SERVER_ERROR;
            parts.headers = HeaderMap::new();
            Bytes::new()
        }
    };

    let completion = Completion {
        pending,
        status: parts.status,
        headers: parts.headers.clone(),
        body: (!bytes.is_empty()).then(|| bytes.clone()),
    };
    Response::from_parts(parts, Body::new(AuditedBody::new(bytes, completion)))
}

/// A request whose `"after"` event has not fired yet.
struct PendingEvent {
    inner: Option<(EventBus, RequestContext)>,
}

impl PendingEvent {
    fn new(bus: EventBus, request: RequestContext) -> Self {
        Self {
            inner: Some((bus, request)),
        }
    }

    fn is_head(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|(_, req)| req.method == Method::HEAD)
    }

    fn complete(mut self, response: ResponseContext) {
        if let Some((bus, request)) = self.inner.take() {
            bus.emit(AFTER, &request, &response);
        }
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        if let Some((bus, request)) = self.inner.take() {
            debug!(request_id = %request.request_id, "request abandoned before response");
            bus.emit(AFTER, &request, &ResponseContext::client_closed(Instant::now()));
        }
    }
}

struct Completion {
    pending: PendingEvent,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Completion {
    fn finish(self, fully_sent: bool) {
        let end_time = Instant::now();
        let response = if fully_sent || self.pending.is_head() {
            ResponseContext {
                status: self.status,
                headers: self.headers,
                body: self.body,
                end_time,
            }
        } else {
            ResponseContext::client_closed(end_time)
        };
        self.pending.complete(response);
    }
}

/// Response body that reports completion to the lifecycle bus when dropped.
pub struct AuditedBody {
    inner: Full<Bytes>,
    completion: Option<Completion>,
}

impl AuditedBody {
    fn new(bytes: Bytes, completion: Completion) -> Self {
        Self {
            inner: Full::new(bytes),
            completion: Some(completion),
        }
    }
}

impl http_body::Body for AuditedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for AuditedBody {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.finish(self.inner.is_end_stream());
        }
    }
}
