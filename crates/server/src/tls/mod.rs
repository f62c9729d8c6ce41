//! TLS key material and rustls configuration.
//!
//! The server only consumes already-provisioned PEM material; nothing here
//! generates, rotates, or persists certificates.

pub mod credentials;

pub use credentials::CredentialBundle;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// The crypto provider used for every rustls config built by this crate.
///
/// Selected explicitly so that no process-wide default has to be installed.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
