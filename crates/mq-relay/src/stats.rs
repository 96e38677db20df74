//! Relay counters.
//!
//! All counters are `AtomicU64` with relaxed ordering; workers bump them
//! without coordination and readers take a point-in-time snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    empty_polls: AtomicU64,
    committed: AtomicU64,
    backed_out: AtomicU64,
    requeued: AtomicU64,
    sink_failures: AtomicU64,
    resolve_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub empty_polls: u64,
    pub committed: u64,
    pub backed_out: u64,
    pub requeued: u64,
    pub sink_failures: u64,
    pub resolve_failures: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backed_out(&self) {
        self.backed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            backed_out: self.backed_out.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Messages received but not yet resolved either way.
    pub fn unresolved(&self) -> u64 {
        self.received
            .saturating_sub(self.committed + self.backed_out + self.requeued + self.resolve_failures)
    }
}
