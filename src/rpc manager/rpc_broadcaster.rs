//! Concurrent broadcast with a per-node deadline

use super::rpc_atomics::{NodeSendStats, FAILING_STREAK};
use super::rpc_errors::RpcError;
use super::BroadcastNode;
use crate::collaborators::SignedTx;
use crate::metrics::ReserveMetrics;
use crate::types::{millis, TxHash};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of one broadcast. `errors` holds every node that failed, even
/// when the broadcast as a whole succeeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastOutcome {
    pub errors: BTreeMap<String, RpcError>,
    pub succeeded: bool,
    pub accepted: Vec<String>,
}

impl BroadcastOutcome {
    pub fn into_parts(self) -> (BTreeMap<String, RpcError>, bool) {
        (self.errors, self.succeeded)
    }
}

struct NodeHandle {
    node: Arc<dyn BroadcastNode>,
    stats: NodeSendStats,
}

/// Sends to every node at once; no retries
pub struct Broadcaster {
    nodes: Vec<NodeHandle>,
    timeout: Duration,
    metrics: Option<Arc<ReserveMetrics>>,
}

impl Broadcaster {
    pub fn new(nodes: Vec<Arc<dyn BroadcastNode>>, timeout: Duration) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| NodeHandle {
                    node,
                    stats: NodeSendStats::new(),
                })
                .collect(),
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReserveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_stats(&self, id: &str) -> Option<&NodeSendStats> {
        self.nodes
            .iter()
            .find(|handle| handle.node.id() == id)
            .map(|handle| &handle.stats)
    }

    async fn send_one(&self, handle: &NodeHandle, tx: &SignedTx) -> (String, Result<TxHash, RpcError>) {
        let id = handle.node.id().to_string();

        let result = match tokio::time::timeout(self.timeout, handle.node.send_raw_transaction(tx)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                node: id.clone(),
                timeout_ms: millis(self.timeout),
            }),
        };

        match &result {
            Ok(_) => {
                let ended = handle.stats.record_accepted();
                if ended >= FAILING_STREAK {
                    info!(node = %id, failures = ended, "Node accepting transactions again");
                }
            }
            Err(e) => {
                let streak = handle.stats.record_failed();
                if let Some(metrics) = &self.metrics {
                    metrics.broadcast_node_failures.with_label_values(&[&id]).inc();
                }
                if streak == FAILING_STREAK {
                    warn!(node = %id, streak, error = %e, "Node failing every broadcast");
                } else {
                    debug!(node = %id, error = %e, "Node did not accept transaction");
                }
            }
        }
        (id, result)
    }

    #[instrument(skip(self, tx), fields(hash = %tx.hash, nonce = tx.nonce))]
    pub async fn broadcast(&self, tx: &SignedTx) -> BroadcastOutcome {
        let results = join_all(self.nodes.iter().map(|handle| self.send_one(handle, tx))).await;

        let mut outcome = BroadcastOutcome::default();
        for (id, result) in results {
            match result {
                Ok(hash) => {
                    if hash != tx.hash {
                        warn!(node = %id, returned = %hash, "Node reported a different tx hash");
                    }
                    outcome.accepted.push(id);
                }
                Err(e) => {
                    outcome.errors.insert(id, e);
                }
            }
        }
        outcome.succeeded = !outcome.accepted.is_empty();

        if outcome.succeeded {
            info!(
                accepted = outcome.accepted.len(),
                failed = outcome.errors.len(),
                "📡 Transaction broadcast"
            );
        } else {
            if let Some(metrics) = &self.metrics {
                metrics.broadcast_no_acceptance.inc();
            }
            warn!(
                nodes = self.nodes.len(),
                failed = outcome.errors.len(),
                "No node accepted the transaction"
            );
        }

        outcome
    }
}
