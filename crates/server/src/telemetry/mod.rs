//! Logging and optional OpenTelemetry span export.
//!
//! # Targets
//!
//! - `diagnostic`: dropped audit records, failing subscribers, sink errors.
//!
//! Log level is configurable via `LOG_LEVEL` (default: `info`) or `RUST_LOG`.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
