//! Audit logger: turns lifecycle events into [`AuditRecord`]s.
//!
//! # Invariants
//!
//! - With body capture disabled, records carry no `requestBody` or
//!   `responseBody` key at all.
//! - Sink failures are counted and reported on the `diagnostic` tracing
//!   target; they never fail the lifecycle dispatch.

pub mod sink;

pub use sink::{AuditSink, WriterSink};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use common::protocol::body_value;
use common::AuditRecord;
use tracing::warn;

use crate::lifecycle::{EventBus, LifecycleEvent, Subscriber, AFTER};

/// What to audit and where to write it.
#[derive(Clone)]
pub struct AuditConfig {
    /// Lifecycle event to subscribe to.
    pub event: String,
    /// Include request and response bodies in each record.
    pub body: bool,
    pub log: Arc<dyn AuditSink>,
}

impl AuditConfig {
    pub fn new(log: Arc<dyn AuditSink>) -> Self {
        Self {
            event: AFTER.into(),
            body: true,
            log,
        }
    }
}

impl std::fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConfig")
            .field("event", &self.event)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Lifecycle subscriber writing one audit record per event.
#[derive(Debug)]
pub struct AuditLogger {
    config: AuditConfig,
    dropped: AtomicU64,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe a new logger to `config.event` on `bus`.
    pub fn attach(bus: &EventBus, config: AuditConfig) -> Arc<AuditLogger> {
        let event = config.event.clone();
        let logger = Arc::new(Self::new(config));
        bus.on_shared(event, logger.clone());
        logger
    }

    /// Records the sink refused or failed to accept.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Build the record for `event` without writing it.
    pub fn record(&self, event: &LifecycleEvent<'_>) -> AuditRecord {
        let req = event.request;
        let resp = event.response;
        let (request_body, response_body) = if self.config.body {
            (
                Some(body_value(req.body.as_ref())),
                Some(body_value(resp.body.as_ref())),
            )
        } else {
            (None, None)
        };

        AuditRecord {
            event: event.name.to_owned(),
            request_id: req.request_id.to_string(),
            method: req.method.to_string(),
            path: req.path.clone(),
            status_code: resp.status.as_u16(),
            duration_ms: u64::try_from(event.duration().as_millis()).unwrap_or(u64::MAX),
            protocol: format!("{:?}", req.version),
            remote_address: req.remote_addr.map(|addr| addr.to_string()),
            time: req
                .received_at
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default(),
            request_body,
            response_body,
        }
    }
}

impl Subscriber for AuditLogger {
    fn on_event(&self, event: &LifecycleEvent<'_>) -> anyhow::Result<()> {
        if event.name != self.config.event {
            return Ok(());
        }
        let record = self.record(event);
        if let Err(e) = self.config.log.write(&record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "diagnostic",
                error = %e,
                request_id = %record.request_id,
                "audit record dropped"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "audit-logger"
    }
}
