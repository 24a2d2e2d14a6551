//! Exclusive nonce lease
//!
//! Holding a lease holds the operator's tracker lock, so assign → sign →
//! broadcast → commit is serialized per operator. Dropping a lease without
//! `commit` leaves the tracker untouched and the nonce is handed out again.

use super::nonce_tracker::NonceTracker;
use crate::types::Address;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

pub struct NonceLease {
    operator: Address,
    nonce: u64,
    tracker: OwnedMutexGuard<NonceTracker>,
}

impl NonceLease {
    pub(crate) fn new(operator: Address, nonce: u64, tracker: OwnedMutexGuard<NonceTracker>) -> Self {
        Self {
            operator,
            nonce,
            tracker,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// The transaction carrying this nonce was accepted by at least one node
    pub fn commit(mut self) {
        self.tracker.mark_used(self.nonce);
        debug!(operator = %self.operator, nonce = self.nonce, "Nonce committed");
    }
}

impl std::fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease")
            .field("operator", &self.operator)
            .field("nonce", &self.nonce)
            .finish()
    }
}
