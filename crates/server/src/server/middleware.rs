//! Defaults for the middleware layers applied to the router.
//!
//! Includes request tracing, timeout enforcement, panic recovery, and the
//! lifecycle tracking layer.

use std::time::Duration;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on a captured request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
