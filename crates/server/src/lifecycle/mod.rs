//! Request lifecycle: per-request contexts, the event bus, and the middleware
//! that emits `"after"` once each response is finished.
//!
//! # Invariants
//!
//! - `"after"` fires exactly once per request that reached processing, after
//!   the response status and body are final.
//! - Handler failures still produce `"after"`, carrying the error status.
//! - A subscriber that errors or panics never affects the request or the
//!   other subscribers of the same event.

pub mod bus;
pub mod context;
pub mod middleware;

pub use bus::{Dispatch, EventBus, Subscriber};
pub use context::{
    LifecycleEvent, RequestContext, ResponseContext, AFTER, CLIENT_CLOSED_REQUEST, EVENTS,
};
pub use middleware::LifecycleState;
