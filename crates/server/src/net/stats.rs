//! Per-listener connection accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
    handshake_failed: AtomicU64,
    idle_closed: AtomicU64,
}

/// Shared counters describing what happened to each accepted connection.
///
/// Cloning is cheap; all clones observe the same counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    inner: Arc<Counters>,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    /// Connections closed because no acceptable protocol was negotiated.
    pub rejected: u64,
    pub handshake_failed: u64,
    /// Connections closed because the peer sent nothing within the idle timeout.
    pub idle_closed: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted connection. The returned guard keeps it counted as
    /// active until dropped.
    pub fn track(&self) -> ActiveGuard {
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn record_rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failed(&self) {
        self.inner.handshake_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_closed(&self) {
        self.inner.idle_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::SeqCst),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            handshake_failed: self.inner.handshake_failed.load(Ordering::Relaxed),
            idle_closed: self.inner.idle_closed.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active connection count on drop.
#[derive(Debug)]
pub struct ActiveGuard {
    inner: Arc<Counters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
