//! Shared helpers for the end-to-end tests: self-signed credentials, TLS
//! clients with chosen ALPN offers, and an in-memory audit sink.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{AuditRecord, SinkError};
use h2_audit_server::audit::AuditSink;
use h2_audit_server::net::NegotiatorConfig;
use h2_audit_server::server::{Server, ServerHandle, ServerOptions, TlsOptions};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const H2: &[u8] = b"h2";
pub const HTTP1: &[u8] = b"http/1.1";

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: CertificateDer<'static>,
}

pub fn self_signed() -> TestCert {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: signing_key.serialize_pem(),
        der: cert.der().clone(),
    }
}

pub fn tls_options(cert: &TestCert, allow_legacy_fallback: bool) -> ServerOptions {
    ServerOptions {
        tls: Some(TlsOptions {
            cert: cert.cert_pem.clone().into_bytes(),
            key: cert.key_pem.clone().into_bytes(),
            ca: None,
        }),
        allow_legacy_fallback,
        negotiator: NegotiatorConfig {
            idle_timeout: Duration::from_millis(300),
            handshake_timeout: Duration::from_secs(2),
        },
        ..ServerOptions::default()
    }
}

pub async fn listen(server: &mut Server) -> ServerHandle {
    server
        .listen("127.0.0.1:0".parse().unwrap(), |_| {})
        .await
        .unwrap()
}

pub async fn connect_tls(
    addr: SocketAddr,
    cert: &TestCert,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.add(cert.der.clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(Arc::new(config)).connect(name, tcp).await
}

pub type H2Sender = http2::SendRequest<Full<Bytes>>;
pub type H1Sender = http1::SendRequest<Full<Bytes>>;

/// HTTP/2 client over `io`; the returned task drives the connection.
pub async fn h2_client<IO>(io: IO) -> (H2Sender, JoinHandle<()>)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
        .await
        .unwrap();
    let task = tokio::spawn(async move {
        let _ = conn.await;
    });
    (sender, task)
}

pub async fn h1_client<IO>(io: IO) -> (H1Sender, JoinHandle<()>)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await.unwrap();
    let task = tokio::spawn(async move {
        let _ = conn.await;
    });
    (sender, task)
}

/// Request with an absolute URI, as HTTP/2 clients send it.
pub fn h2_request(
    method: Method,
    scheme: &str,
    path: &str,
    body: &'static [u8],
) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(format!("{scheme}://localhost{path}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(body)))
        .unwrap()
}

pub fn h1_request(method: Method, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, "localhost")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(body)))
        .unwrap()
}

pub async fn read_response(resp: Response<Incoming>) -> (StatusCode, serde_json::Value) {
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

/// Audit sink forwarding every record to a channel.
pub struct ChannelSink(mpsc::UnboundedSender<AuditRecord>);

impl AuditSink for ChannelSink {
    fn write(&self, record: &AuditRecord) -> Result<(), SinkError> {
        self.0.send(record.clone()).map_err(|_| SinkError::Closed)
    }
}

pub fn channel_sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<AuditRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink(tx)), rx)
}

pub async fn next_record(rx: &mut mpsc::UnboundedReceiver<AuditRecord>) -> AuditRecord {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an audit record")
        .expect("audit channel closed")
}

/// Assert nothing arrives on `rx` for `wait`.
pub async fn assert_no_record(rx: &mut mpsc::UnboundedReceiver<AuditRecord>, wait: Duration) {
    if let Ok(Some(record)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected audit record: {record:?}");
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
