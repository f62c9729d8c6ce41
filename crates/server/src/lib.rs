//! HTTP/2 TLS server with ALPN-negotiated HTTP/1.1 fallback, per-request
//! lifecycle events, and structured audit logging.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use h2_audit_server::server::{handlers, Server, ServerOptions};
//!
//! let mut server = Server::create(ServerOptions::default())?;
//! server.get("/", handlers::hello);
//! let handle = server
//!     .listen("127.0.0.1:8080".parse()?, |url| println!("ready on {url}"))
//!     .await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod server;
pub mod telemetry;
pub mod tls;
