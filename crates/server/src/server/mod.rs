//! Server facade: one owned aggregate holding the route table, the lifecycle
//! bus, and the TLS credentials.
//!
//! # Responsibilities
//! - Validate credentials up front so a bad key pair never reaches `listen`.
//! - Compose routes with the middleware stack (see [`router::build`]).
//! - Bind the protocol negotiator and report the reachable URL exactly once.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;

pub use error::HandlerError;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::handler::Handler;
use axum::routing::{get, post};
use axum::Router;
use common::{BindError, CredentialError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::{AuditConfig, AuditLogger};
use crate::lifecycle::{EventBus, Subscriber};
use crate::net::{self, ConnectionStats, NegotiatorConfig, ProtocolPolicy, StatsSnapshot};
use crate::tls::CredentialBundle;

/// PEM-encoded TLS inputs.
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .field("ca_len", &self.ca.as_ref().map(Vec::len))
            .finish()
    }
}

/// Construction options for [`Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// `None` binds plaintext (protocol auto-detected per connection).
    pub tls: Option<TlsOptions>,
    /// Accept HTTP/1.1 clients that do not offer `h2`.
    pub allow_legacy_fallback: bool,
    pub negotiator: NegotiatorConfig,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tls: None,
            allow_legacy_fallback: true,
            negotiator: NegotiatorConfig::default(),
            request_timeout: middleware::REQUEST_TIMEOUT,
            max_body_bytes: middleware::MAX_BODY_BYTES,
        }
    }
}

pub struct Server {
    options: ServerOptions,
    credentials: Option<Arc<CredentialBundle>>,
    routes: Router,
    bus: EventBus,
    url: Option<String>,
}

impl Server {
    /// Build a server, validating the TLS credentials if any were supplied.
    ///
    /// # Errors
    ///
    /// [`CredentialError`] if the key pair does not parse or match, or the CA
    /// chain is malformed.
    pub fn create(options: ServerOptions) -> Result<Self, CredentialError> {
        let credentials = options
            .tls
            .as_ref()
            .map(|tls| CredentialBundle::load(&tls.cert, &tls.key, tls.ca.as_deref()))
            .transpose()?
            .map(Arc::new);
        if let Some(bundle) = &credentials {
            debug!(
                certs = bundle.cert_chain().len(),
                ca_certs = bundle.ca_chain().map_or(0, <[_]>::len),
                "loaded TLS credentials"
            );
        }

        Ok(Self {
            options,
            credentials,
            routes: Router::new(),
            bus: EventBus::new(),
            url: None,
        })
    }

    /// Register a `GET` handler for an exact path.
    ///
    /// # Panics
    ///
    /// If a `GET` handler is already registered for `path` (axum route overlap).
    pub fn get<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.routes = std::mem::take(&mut self.routes).route(path, get(handler));
        self
    }

    /// Register a `POST` handler for an exact path.
    pub fn post<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.routes = std::mem::take(&mut self.routes).route(path, post(handler));
        self
    }

    /// Subscribe to a lifecycle event.
    pub fn on(&mut self, event: impl Into<String>, subscriber: impl Subscriber) -> &mut Self {
        self.bus.on(event, subscriber);
        self
    }

    /// Attach an [`AuditLogger`] to this server's bus.
    pub fn audit(&mut self, config: AuditConfig) -> Arc<AuditLogger> {
        AuditLogger::attach(&self.bus, config)
    }

    /// URL reported to `on_ready`; `None` before [`Server::listen`] succeeds.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// The routed application with the full middleware stack.
    pub(crate) fn app(&self) -> Router {
        router::build(
            self.routes.clone(),
            self.bus.clone(),
            self.options.request_timeout,
            self.options.max_body_bytes,
        )
    }

    /// Bind `addr`, start accepting, then call `on_ready` once with the URL.
    ///
    /// # Errors
    ///
    /// [`BindError::AddressInUse`] / [`BindError::Io`] if the socket cannot be
    /// bound, [`BindError::Credential`] if the TLS config cannot be built.
    /// `on_ready` is not called on error.
    pub async fn listen(
        &mut self,
        addr: SocketAddr,
        on_ready: impl FnOnce(&str),
    ) -> Result<ServerHandle, BindError> {
        let policy = ProtocolPolicy::new(self.options.allow_legacy_fallback);
        let listener = net::bind(
            addr,
            self.credentials.clone(),
            policy,
            self.options.negotiator,
        )
        .await?;

        let local_addr = listener.local_addr();
        let url = reachable_url(local_addr, listener.is_tls());
        let stats = listener.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.serve(self.app(), shutdown.clone()));

        self.url = Some(url.clone());
        on_ready(&url);

        Ok(ServerHandle {
            url,
            local_addr,
            stats,
            shutdown,
            task,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("tls", &self.credentials.is_some())
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// A running listener.
#[derive(Debug)]
pub struct ServerHandle {
    url: String,
    local_addr: SocketAddr,
    stats: ConnectionStats,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting and wait for the accept loop to exit. Open connections
    /// are told to drain and finish on their own tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "accept loop terminated abnormally");
        }
        info!(url = %self.url, "server stopped");
    }
}

/// URL a local client can use to reach `addr`. Unspecified bind addresses
/// map to loopback.
fn reachable_url(addr: SocketAddr, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("{scheme}://{}", SocketAddr::new(ip, addr.port()))
}
