//! Error taxonomy shared across crates.
//!
//! Startup errors ([`CredentialError`], fatal [`BindError`] variants) surface to
//! the caller and abort the process path that invoked them. Per-connection
//! and per-sink errors are contained where they occur and reported through
//! `tracing`.

use std::io;

use thiserror::Error;

/// Failure to build a credential bundle from PEM material.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The certificate and private key are missing, unparsable, or do not
    /// belong together.
    #[error("invalid key pair: {0}")]
    InvalidKeyPair(String),

    /// CA material was supplied but does not parse as a certificate chain.
    #[error("malformed CA chain: {0}")]
    MalformedCa(String),

    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Failure while binding the listener or negotiating a single connection.
#[derive(Debug, Error)]
pub enum BindError {
    /// The requested address is already bound by another socket.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// The peer did not offer a protocol the policy accepts.
    ///
    /// Reported per connection; the listener keeps running.
    #[error("protocol rejected: {0}")]
    ProtocolRejected(String),

    /// The credential bundle could not be turned into a TLS configuration.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Any other socket-level failure.
    #[error("listener I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for BindError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse(e.to_string()),
            _ => BindError::Io(e),
        }
    }
}

/// Failure to hand an audit record to its output sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink's queue is full; the record was not accepted.
    #[error("audit sink backlog full ({capacity} records)")]
    Backpressure { capacity: usize },

    /// The sink's background writer has stopped.
    #[error("audit sink closed")]
    Closed,

    /// The record could not be serialised.
    #[error("audit record serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The underlying writer failed.
    #[error("audit sink I/O error: {0}")]
    Io(#[from] io::Error),
}
