//! Configuration loading and validation for the server binary.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is present but invalid.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use common::CredentialError;
use serde::Deserialize;

use crate::lifecycle::EVENTS;
use crate::net::NegotiatorConfig;
use crate::server::{ServerOptions, TlsOptions};
use crate::tls::credentials::read_pem;

/// Validated server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// PEM certificate chain. Without cert and key the server runs plaintext.
    pub tls_cert_path: Option<PathBuf>,

    /// PEM private key matching `tls_cert_path`.
    pub tls_key_path: Option<PathBuf>,

    /// Optional PEM CA chain appended to the served chain.
    pub tls_ca_path: Option<PathBuf>,

    /// Accept HTTP/1.1 clients that do not offer `h2`.
    #[serde(default = "default_true")]
    pub allow_http1: bool,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body accepted (and captured for auditing).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Lifecycle event the audit logger subscribes to.
    #[serde(default = "default_audit_event")]
    pub audit_event: String,

    /// Include request/response bodies in audit records.
    #[serde(default = "default_true")]
    pub audit_body: bool,

    /// NDJSON audit file. When unset, records are written to stdout.
    pub audit_log_path: Option<PathBuf>,

    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP collector endpoint. Span export is disabled when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_true() -> bool {
    true
}
fn default_idle_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_audit_event() -> String {
    "after".into()
}
fn default_audit_queue_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the combination is
    /// invalid.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) => anyhow::bail!("TLS_KEY_PATH is required when TLS_CERT_PATH is set"),
            (None, Some(_)) => anyhow::bail!("TLS_CERT_PATH is required when TLS_KEY_PATH is set"),
            _ => {}
        }
        if self.tls_ca_path.is_some() && self.tls_cert_path.is_none() {
            anyhow::bail!("TLS_CA_PATH requires TLS_CERT_PATH and TLS_KEY_PATH");
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("IDLE_TIMEOUT_SECS must be > 0");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("HANDSHAKE_TIMEOUT_SECS must be > 0");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be > 0");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("MAX_BODY_BYTES must be > 0");
        }
        if self.audit_queue_capacity == 0 {
            anyhow::bail!("AUDIT_QUEUE_CAPACITY must be > 0");
        }
        if !EVENTS.contains(&self.audit_event.as_str()) {
            anyhow::bail!(
                "AUDIT_EVENT {:?} is not an emitted lifecycle event (expected one of {EVENTS:?})",
                self.audit_event
            );
        }
        if let Some(endpoint) = &self.otel_exporter_otlp_endpoint {
            ensure_non_empty(endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Read the configured PEM files. `Ok(None)` means plaintext.
    ///
    /// # Errors
    ///
    /// [`CredentialError::Io`] naming the file that could not be read.
    pub fn tls_options(&self) -> Result<Option<TlsOptions>, CredentialError> {
        let (Some(cert), Some(key)) = (&self.tls_cert_path, &self.tls_key_path) else {
            return Ok(None);
        };
        Ok(Some(TlsOptions {
            cert: read_pem(cert)?,
            key: read_pem(key)?,
            ca: self.tls_ca_path.as_deref().map(read_pem).transpose()?,
        }))
    }

    /// Assemble [`ServerOptions`], loading PEM material from disk.
    pub fn server_options(&self) -> Result<ServerOptions, CredentialError> {
        Ok(ServerOptions {
            tls: self.tls_options()?,
            allow_legacy_fallback: self.allow_http1,
            negotiator: NegotiatorConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_body_bytes: self.max_body_bytes,
        })
    }

    pub fn audit_log_path(&self) -> Option<&Path> {
        self.audit_log_path.as_deref()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} must not be empty");
    }
    Ok(())
}
