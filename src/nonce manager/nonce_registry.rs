//! Per-operator trackers fed from a node

use super::nonce_errors::{NonceError, NonceResult};
use super::nonce_lease::NonceLease;
use super::nonce_tracker::{NonceTracker, NonceTransition};
use crate::collaborators::Blockchain;
use crate::types::{millis, Address};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Which nonce the node is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSource {
    /// Next nonce including the pending pool; used to assign nonces
    Pending,
    /// Transactions already mined; used to judge lost transactions
    Mined,
}

pub struct NonceRegistry {
    trackers: DashMap<Address, Arc<Mutex<NonceTracker>>>,
    source: NonceSource,
    expiry: Duration,
    query_timeout: Duration,
}

impl NonceRegistry {
    pub fn new(source: NonceSource, expiry: Duration, query_timeout: Duration) -> Self {
        Self {
            trackers: DashMap::new(),
            source,
            expiry,
            query_timeout,
        }
    }

    fn tracker(&self, operator: Address) -> Arc<Mutex<NonceTracker>> {
        self.trackers
            .entry(operator)
            .or_insert_with(|| Arc::new(Mutex::new(NonceTracker::new(self.expiry))))
            .clone()
    }

    async fn query(&self, chain: &dyn Blockchain, operator: Address) -> NonceResult<u64> {
        let call = async {
            match self.source {
                NonceSource::Pending => chain.pending_nonce(operator).await,
                NonceSource::Mined => chain.mined_nonce(operator).await,
            }
        };

        match tokio::time::timeout(self.query_timeout, call).await {
            Ok(Ok(nonce)) => Ok(nonce),
            Ok(Err(e)) => Err(NonceError::from_chain_error(e, operator)),
            Err(_) => Err(NonceError::Timeout(millis(self.query_timeout))),
        }
    }

    fn apply(tracker: &mut NonceTracker, operator: Address, observed: u64) -> u64 {
        let before = tracker.trusted();
        let transition = tracker.reconcile(observed);
        match transition {
            NonceTransition::Held => {
                debug!(operator = %operator, observed, trusted = ?before, "Node nonce behind trusted value, holding");
            }
            NonceTransition::Expired => {
                warn!(operator = %operator, observed, previous = ?before, "Trusted nonce expired, adopting node value");
            }
            _ => {}
        }
        // reconcile always leaves the tracker trusted
        tracker.trusted().unwrap_or(observed)
    }

    /// Reconcile the operator's tracker against the node and return the
    /// trusted nonce. Node failures are returned, never read as zero.
    pub async fn observe(&self, chain: &dyn Blockchain, operator: Address) -> NonceResult<u64> {
        let tracker = self.tracker(operator);
        let mut guard = tracker.lock().await;
        let observed = self.query(chain, operator).await?;
        Ok(Self::apply(&mut guard, operator, observed))
    }

    /// Lease the next nonce for `operator`. Other callers for the same
    /// operator wait until the lease is committed or dropped.
    pub async fn lease(&self, chain: &dyn Blockchain, operator: Address) -> NonceResult<NonceLease> {
        let tracker = self.tracker(operator);
        let mut guard = tracker.lock_owned().await;
        let observed = self.query(chain, operator).await?;
        let nonce = Self::apply(&mut guard, operator, observed);
        debug!(operator = %operator, nonce, "Nonce leased");
        Ok(NonceLease::new(operator, nonce, guard))
    }

    /// Last trusted value without asking the node
    pub async fn trusted(&self, operator: Address) -> Option<u64> {
        let tracker = self.trackers.get(&operator).map(|t| t.clone())?;
        let guard = tracker.lock().await;
        guard.trusted()
    }
}
