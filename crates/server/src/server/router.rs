//! Axum router construction.

use std::time::Duration;

use axum::Router;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::handlers;
use crate::lifecycle::{self, EventBus, LifecycleState};

/// Wrap the registered `routes` with the fallback and the middleware stack.
///
/// The lifecycle layer sits outside the timeout and panic layers so that
/// timed-out (408) and panicked (500) requests still produce `"after"`.
pub fn build(
    routes: Router,
    bus: EventBus,
    request_timeout: Duration,
    max_body_bytes: usize,
) -> Router {
    let lifecycle_state = LifecycleState {
        bus,
        max_body_bytes,
    };
    routes
        .fallback(handlers::not_found)
        .layer(CatchPanicLayer::custom(handlers::panic_response))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum::middleware::from_fn_with_state(
            lifecycle_state,
            lifecycle::middleware::track,
        ))
        .layer(TraceLayer::new_for_http())
}
