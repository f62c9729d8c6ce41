//! Protocol-negotiating listener.
//!
//! One TCP port serves both HTTP/2 and HTTP/1.1. With TLS the protocol is
//! chosen once per connection from the ALPN result and carried as a
//! [`NegotiatedProtocol`]; the matching hyper connection builder then owns the
//! socket. Whatever the transport, every logical request reaches the
//! application service as one `Request`, so upstream code never sees whether
//! it arrived on a multiplexed h2 stream or a serial HTTP/1.1 connection.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use common::BindError;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

use super::rewind::{await_preface, Preface, Rewind};
use super::stats::ConnectionStats;
use crate::tls::{CredentialBundle, ALPN_H2, ALPN_HTTP1};

/// Run a hyper connection to completion, switching to a graceful shutdown
/// when the token fires.
macro_rules! drive {
    ($conn:expr, $shutdown:expr) => {{
        let conn = $conn;
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => res,
            _ = $shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        }
    }};
}

/// The protocol the server prefers when the peer supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferredProtocol {
    /// Multiplexed, binary-framed HTTP/2.
    #[default]
    Modern,
}

/// Which protocols a TLS connection may end up speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolPolicy {
    pub preferred: PreferredProtocol,
    /// Serve HTTP/1.1 to peers that do not offer h2. When `false` such peers
    /// are rejected during the handshake instead of being downgraded.
    pub allow_legacy_fallback: bool,
}

impl ProtocolPolicy {
    pub fn new(allow_legacy_fallback: bool) -> Self {
        Self {
            preferred: PreferredProtocol::Modern,
            allow_legacy_fallback,
        }
    }

    /// ALPN identifiers to advertise, most preferred first.
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        let mut protocols = match self.preferred {
            PreferredProtocol::Modern => vec![ALPN_H2.to_vec()],
        };
        if self.allow_legacy_fallback {
            protocols.push(ALPN_HTTP1.to_vec());
        }
        protocols
    }

    /// Decide the connection protocol from the ALPN outcome.
    ///
    /// A peer that negotiated no ALPN protocol at all is treated as a legacy
    /// HTTP/1.1 client.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::ProtocolRejected`] when the outcome is not allowed
    /// by this policy.
    pub fn resolve(&self, alpn: Option<&[u8]>) -> Result<NegotiatedProtocol, BindError> {
        match alpn {
            Some(p) if p == ALPN_H2 => Ok(NegotiatedProtocol::Http2),
            Some(p) if p == ALPN_HTTP1 && self.allow_legacy_fallback => {
                Ok(NegotiatedProtocol::Http1)
            }
            None if self.allow_legacy_fallback => Ok(NegotiatedProtocol::Http1),
            Some(p) => Err(BindError::ProtocolRejected(format!(
                "ALPN protocol {:?} not permitted",
                String::from_utf8_lossy(p)
            ))),
            None => Err(BindError::ProtocolRejected(
                "peer did not negotiate h2 and legacy fallback is disabled".into(),
            )),
        }
    }
}

impl Default for ProtocolPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Protocol selected for one TLS connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    Http2,
    Http1,
}

impl NegotiatedProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatedProtocol::Http2 => "h2",
            NegotiatedProtocol::Http1 => "http/1.1",
        }
    }
}

/// Connection metadata attached to every request as an extension.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
}

/// Timeouts applied to each accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorConfig {
    /// How long a connection may stay silent before its first request bytes
    /// (and, on HTTP/1.1, between requests) before it is closed.
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// A bound listener ready to serve an application service.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    policy: ProtocolPolicy,
    config: NegotiatorConfig,
    stats: ConnectionStats,
}

/// Bind `addr`, with TLS when `credentials` are given and plaintext otherwise.
///
/// # Errors
///
/// [`BindError::Credential`] if the TLS configuration cannot be built and
/// [`BindError::AddressInUse`] / [`BindError::Io`] if the socket cannot be
/// bound. Both are returned as-is; nothing is retried.
pub async fn bind(
    addr: SocketAddr,
    credentials: Option<Arc<CredentialBundle>>,
    policy: ProtocolPolicy,
    config: NegotiatorConfig,
) -> Result<Listener, BindError> {
    let acceptor = credentials
        .map(|bundle| {
            bundle
                .server_config(policy.alpn_protocols())
                .map(|cfg| TlsAcceptor::from(Arc::new(cfg)))
        })
        .transpose()?;

    let inner = TcpListener::bind(addr).await?;
    let local_addr = inner.local_addr()?;

    info!(
        addr = %local_addr,
        tls = acceptor.is_some(),
        allow_legacy_fallback = policy.allow_legacy_fallback,
        "listener bound"
    );

    Ok(Listener {
        inner,
        local_addr,
        acceptor,
        policy,
        config,
        stats: ConnectionStats::new(),
    })
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Accept loop. Runs until `shutdown` is cancelled; in-flight connections
    /// are then asked to finish gracefully.
    pub async fn serve<S>(self, app: S, shutdown: CancellationToken)
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %self.local_addr, "listener shutting down");
                    break;
                }
                res = self.inner.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "accept error");
                        continue;
                    }
                },
            };

            let conn = ConnectionTask {
                peer,
                acceptor: self.acceptor.clone(),
                policy: self.policy,
                config: self.config,
                stats: self.stats.clone(),
                shutdown: shutdown.clone(),
            };
            let app = app.clone();
            tokio::spawn(conn.run(stream, app));
        }
    }
}

struct ConnectionTask {
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    policy: ProtocolPolicy,
    config: NegotiatorConfig,
    stats: ConnectionStats,
    shutdown: CancellationToken,
}

impl ConnectionTask {
    async fn run<S>(self, stream: TcpStream, app: S)
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let _active = self.stats.track();
        let peer = self.peer;
        debug!(%peer, "accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let Some(acceptor) = self.acceptor.clone() else {
            if let Some(io) = self.preface(stream).await {
                self.serve_http(io, None, app).await;
            }
            return;
        };

        let mut tls = match tokio::time::timeout(
            self.config.handshake_timeout,
            acceptor.accept(stream),
        )
        .await
        {
            Err(_) => {
                self.stats.record_handshake_failed();
                debug!(%peer, "TLS handshake timed out");
                return;
            }
            Ok(Err(e)) if is_no_application_protocol(&e) => {
                self.stats.record_rejected();
                let err = BindError::ProtocolRejected(
                    "client offered no protocol accepted by the server".into(),
                );
                warn!(%peer, error = %err, "connection rejected during handshake");
                return;
            }
            Ok(Err(e)) => {
                self.stats.record_handshake_failed();
                debug!(%peer, error = %e, "TLS handshake failed");
                return;
            }
            Ok(Ok(tls)) => tls,
        };

        let protocol = match self.policy.resolve(tls.get_ref().1.alpn_protocol()) {
            Ok(protocol) => protocol,
            Err(e) => {
                self.stats.record_rejected();
                warn!(%peer, error = %e, "connection rejected after handshake");
                let _ = tls.shutdown().await;
                return;
            }
        };
        debug!(%peer, protocol = protocol.as_str(), "protocol negotiated");

        if let Some(io) = self.preface(tls).await {
            self.serve_http(io, Some(protocol), app).await;
        }
    }

    /// Wait for the first request bytes, accounting for idle peers.
    async fn preface<IO>(&self, io: IO) -> Option<Rewind<IO>>
    where
        IO: AsyncRead + Unpin,
    {
        match await_preface(io, self.config.idle_timeout).await {
            Preface::Ready(io) => Some(io),
            Preface::Idle => {
                self.stats.record_idle_closed();
                debug!(peer = %self.peer, "closing idle connection");
                None
            }
            Preface::Closed => {
                debug!(peer = %self.peer, "peer closed before sending a request");
                None
            }
        }
    }

    async fn serve_http<IO, S>(&self, io: IO, protocol: Option<NegotiatedProtocol>, app: S)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let info = ConnectionInfo {
            remote_addr: self.peer,
        };
        let svc = service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(info);
            app.clone().oneshot(req.map(Body::new))
        });
        let io = TokioIo::new(io);
        let shutdown = &self.shutdown;

        let result = match protocol {
            Some(NegotiatedProtocol::Http2) => {
                let mut builder = http2::Builder::new(TokioExecutor::new());
                builder.timer(TokioTimer::new());
                drive!(builder.serve_connection(io, svc), shutdown).map_err(|e| e.to_string())
            }
            Some(NegotiatedProtocol::Http1) => {
                let mut builder = http1::Builder::new();
                builder
                    .timer(TokioTimer::new())
                    .header_read_timeout(self.config.idle_timeout);
                drive!(builder.serve_connection(io, svc), shutdown).map_err(|e| e.to_string())
            }
            None => {
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(self.config.idle_timeout);
                drive!(builder.serve_connection(io, svc), shutdown).map_err(|e| e.to_string())
            }
        };

        if let Err(e) = result {
            debug!(peer = %self.peer, error = %e, "connection closed with error");
        }
    }
}

fn is_no_application_protocol(e: &io::Error) -> bool {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|inner| matches!(inner, rustls::Error::NoApplicationProtocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_list_with_fallback() {
        let policy = ProtocolPolicy::new(true);
        assert_eq!(policy.alpn_protocols(), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn alpn_list_without_fallback() {
        let policy = ProtocolPolicy::new(false);
        assert_eq!(policy.alpn_protocols(), vec![b"h2".to_vec()]);
    }

    #[test]
    fn h2_always_selected() {
        for fallback in [true, false] {
            let policy = ProtocolPolicy::new(fallback);
            assert_eq!(policy.resolve(Some(b"h2")).unwrap(), NegotiatedProtocol::Http2);
        }
    }

    #[test]
    fn legacy_allowed_with_fallback() {
        let policy = ProtocolPolicy::new(true);
        assert_eq!(
            policy.resolve(Some(b"http/1.1")).unwrap(),
            NegotiatedProtocol::Http1
        );
        assert_eq!(policy.resolve(None).unwrap(), NegotiatedProtocol::Http1);
    }

    #[test]
    fn legacy_rejected_without_fallback() {
        let policy = ProtocolPolicy::new(false);
        assert!(matches!(
            policy.resolve(Some(b"http/1.1")),
            Err(BindError::ProtocolRejected(_))
        ));
        assert!(matches!(policy.resolve(None), Err(BindError::ProtocolRejected(_))));
    }

    #[test]
    fn unknown_protocol_rejected() {
        let policy = ProtocolPolicy::new(true);
        assert!(matches!(
            policy.resolve(Some(b"spdy/3")),
            Err(BindError::ProtocolRejected(_))
        ));
    }

    #[test]
    fn detects_no_application_protocol() {
        let e = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::NoApplicationProtocol);
        assert!(is_no_application_protocol(&e));
        let other = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(!is_no_application_protocol(&other));
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = bind(addr, None, ProtocolPolicy::default(), NegotiatorConfig::default())
            .await
            .err()
            .expect("second bind must fail");
        assert!(matches!(err, BindError::AddressInUse(_)), "got {err:?}");
    }
}
