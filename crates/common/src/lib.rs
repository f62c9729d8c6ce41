//! Shared error taxonomy and record types for the `h2-audit-server` crates.

pub mod error;
pub mod protocol;

pub use error::{BindError, CredentialError, SinkError};
pub use protocol::AuditRecord;
