//! Listener, TLS handshake, ALPN protocol selection, and per-connection
//! hyper serving.

pub mod negotiator;
pub mod rewind;
pub mod stats;

pub use negotiator::{
    bind, ConnectionInfo, Listener, NegotiatedProtocol, NegotiatorConfig, PreferredProtocol,
    ProtocolPolicy,
};
pub use stats::{ConnectionStats, StatsSnapshot};
