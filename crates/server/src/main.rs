//! `h2-audit-server` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP spans).
//! 3. Load TLS material and build the [`Server`].
//! 4. Attach the audit logger to the configured lifecycle event, writing
//!    NDJSON to `AUDIT_LOG_PATH` or stdout through a bounded queue.
//! 5. Listen until Ctrl-C, then drain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use h2_audit_server::audit::{AuditConfig, WriterSink};
use h2_audit_server::config::Config;
use h2_audit_server::server::{handlers, Server};
use h2_audit_server::telemetry;

const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        tls = cfg.tls_cert_path.is_some(),
        allow_http1 = cfg.allow_http1,
        "h2-audit-server starting"
    );

    let options = cfg
        .server_options()
        .context("failed to load TLS material")?;
    let mut server = Server::create(options).context("invalid TLS credentials")?;
    server.get("/", handlers::hello);

    let (sink, writer_task) = WriterSink::open(cfg.audit_log_path(), cfg.audit_queue_capacity)
        .await
        .context("failed to open audit log")?;
    let audit = server.audit(AuditConfig {
        event: cfg.audit_event.clone(),
        body: cfg.audit_body,
        log: Arc::new(sink),
    });

    let handle = server
        .listen(cfg.listen_addr(), |url| info!("ready on {url}"))
        .await
        .context("failed to start listener")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(stats = ?handle.stats(), "shutdown requested");
    handle.shutdown().await;

    // The writer drains once every sink handle is gone; connections still
    // finishing keep theirs, so wait only briefly.
    info!(dropped = audit.dropped_records(), "audit records refused by the sink");
    drop(server);
    drop(audit);
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer_task).await.is_err() {
        tracing::warn!(target: "diagnostic", "audit writer did not drain before exit");
    }

    telemetry::shutdown_telemetry();
    Ok(())
}
