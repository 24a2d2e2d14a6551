//! Trusted-nonce state machine for one operator
//!
//! A node can lag behind the transactions we already sent, so a lower
//! observed nonce is not believed right away. It is only adopted once the
//! trusted value has gone unconfirmed for longer than the expiry window.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceState {
    Unknown,
    Trusted { nonce: u64, since: Instant },
}

/// What a reconcile step did to the trusted nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTransition {
    /// First observation
    Adopted,
    /// Observed value at or above trusted
    Advanced,
    /// Observed value below trusted, still inside the window
    Held,
    /// Observed value below trusted and the window ran out
    Expired,
}

#[derive(Debug, Clone)]
pub struct NonceTracker {
    state: NonceState,
    expiry: Duration,
}

impl NonceTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            state: NonceState::Unknown,
            expiry,
        }
    }

    pub fn state(&self) -> NonceState {
        self.state
    }

    pub fn trusted(&self) -> Option<u64> {
        match self.state {
            NonceState::Unknown => None,
            NonceState::Trusted { nonce, .. } => Some(nonce),
        }
    }

    pub fn reconcile(&mut self, observed: u64) -> NonceTransition {
        self.reconcile_at(observed, Instant::now())
    }

    pub fn reconcile_at(&mut self, observed: u64, now: Instant) -> NonceTransition {
        let transition = match self.state {
            NonceState::Unknown => NonceTransition::Adopted,
            NonceState::Trusted { nonce, .. } if observed >= nonce => NonceTransition::Advanced,
            NonceState::Trusted { since, .. } => {
                if now.saturating_duration_since(since) > self.expiry {
                    NonceTransition::Expired
                } else {
                    return NonceTransition::Held;
                }
            }
        };

        self.state = NonceState::Trusted {
            nonce: observed,
            since: now,
        };
        transition
    }

    /// Record that `nonce` was handed to an accepted transaction
    pub fn mark_used(&mut self, nonce: u64) {
        self.mark_used_at(nonce, Instant::now());
    }

    pub fn mark_used_at(&mut self, nonce: u64, now: Instant) {
        let next = nonce.saturating_add(1);
        let nonce = match self.state {
            NonceState::Trusted { nonce: trusted, .. } => trusted.max(next),
            NonceState::Unknown => next,
        };
        self.state = NonceState::Trusted { nonce, since: now };
    }
}
