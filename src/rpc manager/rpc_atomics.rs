//! Per-node send counters, updated from concurrent broadcasts

use std::sync::atomic::{AtomicU64, Ordering};

/// Failures in a row after which a node is reported as failing
pub const FAILING_STREAK: u64 = 3;

/// Counters for one broadcast node. They only drive reporting; every
/// broadcast still goes to every node.
#[derive(Debug, Default)]
pub struct NodeSendStats {
    sends: AtomicU64,
    failures: AtomicU64,
    streak: AtomicU64,
}

impl NodeSendStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the failure streak this success ended
    pub fn record_accepted(&self) -> u64 {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.streak.swap(0, Ordering::Relaxed)
    }

    /// Returns the failure streak including this failure
    pub fn record_failed(&self) -> u64 {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn failure_streak(&self) -> u64 {
        self.streak.load(Ordering::Relaxed)
    }

    pub fn is_failing(&self) -> bool {
        self.failure_streak() >= FAILING_STREAK
    }
}
