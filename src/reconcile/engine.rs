//! Activity reconciliation cycle

use super::double_check::{double_check, DoubleCheckPolicy, StatusMap};
use super::errors::ReconcileError;
use super::exchange_status::ExchangeResolver;
use super::merge::merge;
use super::mining::MiningResolver;
use super::sources::{ChainSource, ExchangeSource};
use crate::collaborators::{Blockchain, Exchange, Storage, StorageError};
use crate::config::{NonceConfig, ReconcileConfig};
use crate::logging::CycleLogger;
use crate::metrics::{ReserveMetrics, Timer};
use crate::nonce_manager::{NonceRegistry, NonceSource};
use crate::types::{
    now_millis, ActivityRecord, ActivityStatus, Address, AuthDataSnapshot, Domain, DomainSnapshot,
    ExchangeBalanceEntry, ExchangeId, MiningStatus, Timepoint,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Everything one cycle learned before it is written out
struct CycleOutcome {
    statuses: StatusMap,
    chain_balances: Option<BTreeMap<String, u128>>,
    exchange_balances: BTreeMap<ExchangeId, ExchangeBalanceEntry>,
    failed_exchanges: BTreeMap<ExchangeId, String>,
    errors: Vec<String>,
}

pub struct ReconcileEngine {
    chain: Arc<dyn Blockchain>,
    exchanges: BTreeMap<ExchangeId, Arc<dyn Exchange>>,
    storage: Arc<dyn Storage>,
    reserve: Address,
    mined_nonces: NonceRegistry,
    mining: MiningResolver,
    exchange_resolver: ExchangeResolver,
    policy: DoubleCheckPolicy,
    call_timeout: Duration,
    metrics: Option<Arc<ReserveMetrics>>,
}

impl ReconcileEngine {
    pub fn new(
        chain: Arc<dyn Blockchain>,
        exchanges: Vec<Arc<dyn Exchange>>,
        storage: Arc<dyn Storage>,
        reserve: Address,
        config: &ReconcileConfig,
        nonce: &NonceConfig,
    ) -> Self {
        Self {
            chain,
            exchanges: exchanges.into_iter().map(|e| (e.id(), e)).collect(),
            storage,
            reserve,
            mined_nonces: NonceRegistry::new(
                NonceSource::Mined,
                nonce.expiry(),
                config.call_timeout(),
            ),
            mining: MiningResolver::new(config.lost_tx_expiry_secs),
            exchange_resolver: ExchangeResolver::new(
                config.max_activity_lifetime_secs,
                config.call_timeout(),
            ),
            policy: DoubleCheckPolicy::from_config(&config.double_check),
            call_timeout: config.call_timeout(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReserveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Trusted mined nonce used to write off lost transactions
    pub async fn trusted_mined_nonce(&self, operator: Address) -> Option<u64> {
        self.mined_nonces.trusted(operator).await
    }

    /// Run one cycle at `timepoint` against chain state at `block` and
    /// persist the resulting snapshot. Per-source and per-activity failures
    /// end up in the snapshot; only storage failures abort the cycle.
    #[instrument(skip(self), fields(pending = tracing::field::Empty))]
    pub async fn reconcile(
        &self,
        timepoint: Timepoint,
        block: u64,
    ) -> Result<AuthDataSnapshot, ReconcileError> {
        let timer = Timer::new();
        let logger = CycleLogger::new(Domain::Auth);
        logger.log_cycle_start(timepoint);

        let pending = match self.storage.pending_activities().await {
            Ok(pending) => pending,
            Err(e) => {
                logger.error(&format!("Cannot read pending activities: {}", e));
                return Err(e.into());
            }
        };
        tracing::Span::current().record("pending", pending.len());

        let mut outcome = self.collect(&pending, timepoint, block, &logger).await;

        let (pending_after, write_errors) = self.apply(pending, &outcome.statuses, &logger).await;
        outcome.errors.extend(write_errors);

        let previous = if outcome.chain_balances.is_none() || !outcome.failed_exchanges.is_empty() {
            self.previous_snapshot(timepoint, &logger).await?
        } else {
            None
        };

        for (id, error) in &outcome.failed_exchanges {
            let entry = substitute_balance(previous.as_ref(), id, error, timepoint);
            outcome.exchange_balances.insert(id.clone(), entry);
        }

        let chain_balances = match outcome.chain_balances {
            Some(balances) => balances,
            None => previous
                .as_ref()
                .map(|p| p.chain_balances.clone())
                .unwrap_or_default(),
        };

        let valid = outcome.errors.is_empty();
        let snapshot = AuthDataSnapshot {
            timepoint,
            valid,
            error: if valid {
                None
            } else {
                Some(outcome.errors.join("; "))
            },
            block,
            chain_balances,
            exchange_balances: outcome.exchange_balances,
            pending_activities: pending_after,
        };

        let version = match self
            .storage
            .put_snapshot(DomainSnapshot::Auth(snapshot.clone()))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                logger.error(&format!("Cannot persist auth snapshot: {}", e));
                return Err(e.into());
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.pending_activities.set(snapshot.pending_activities.len() as i64);
            metrics.record_cycle(&Domain::Auth.to_string(), valid);
            timer.observe_duration(&metrics.reconcile_latency);
        }
        logger.log_snapshot_persisted(version, valid, timer.elapsed_ms());

        Ok(snapshot)
    }

    /// Latest persisted snapshot; `None` only when there is none yet
    async fn previous_snapshot(
        &self,
        timepoint: Timepoint,
        logger: &CycleLogger,
    ) -> Result<Option<AuthDataSnapshot>, ReconcileError> {
        match self.storage.latest_auth_data(timepoint).await {
            Ok(previous) => Ok(Some(previous)),
            Err(StorageError::NoVersion { .. }) => Ok(None),
            Err(e) => {
                logger.error(&format!("Cannot read previous auth snapshot: {}", e));
                Err(e.into())
            }
        }
    }

    /// Persist an invalid snapshot for a cycle that could not run at all.
    /// Balances carry over from the latest snapshot and pending activities
    /// are listed untouched.
    pub async fn record_failed_cycle(
        &self,
        timepoint: Timepoint,
        error: &str,
    ) -> Result<AuthDataSnapshot, ReconcileError> {
        let logger = CycleLogger::new(Domain::Auth);
        logger.log_fetch_failure("blockchain", error, true);

        let previous = self.previous_snapshot(timepoint, &logger).await?;
        let pending_activities = self.storage.pending_activities().await?;
        let exchange_balances = self
            .exchanges
            .keys()
            .map(|id| (id.clone(), substitute_balance(previous.as_ref(), id, error, timepoint)))
            .collect();

        let snapshot = AuthDataSnapshot {
            timepoint,
            valid: false,
            error: Some(error.to_string()),
            block: previous.as_ref().map(|p| p.block).unwrap_or(0),
            chain_balances: previous.map(|p| p.chain_balances).unwrap_or_default(),
            exchange_balances,
            pending_activities,
        };

        let version = self
            .storage
            .put_snapshot(DomainSnapshot::Auth(snapshot.clone()))
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&Domain::Auth.to_string(), false);
        }
        logger.log_snapshot_persisted(version, false, 0);
        Ok(snapshot)
    }

    /// Double-check the chain and every exchange concurrently
    async fn collect(
        &self,
        pending: &[ActivityRecord],
        now: Timepoint,
        block: u64,
        logger: &CycleLogger,
    ) -> CycleOutcome {
        let metrics = self.metrics.as_deref();

        let chain_source = ChainSource {
            chain: self.chain.as_ref(),
            records: pending
                .iter()
                .filter(|r| r.is_blockchain_pending() && r.result.tx_hash.is_some())
                .collect(),
            resolver: &self.mining,
            mined_nonces: &self.mined_nonces,
            reserve: self.reserve,
            block,
            now,
            call_timeout: self.call_timeout,
        };

        let exchange_sources: Vec<ExchangeSource<'_>> = self
            .exchanges
            .iter()
            .map(|(id, exchange)| ExchangeSource {
                exchange: exchange.as_ref(),
                records: pending
                    .iter()
                    .filter(|r| r.is_exchange_pending() && r.action.exchange() == Some(id))
                    .collect(),
                resolver: &self.exchange_resolver,
                now,
                call_timeout: self.call_timeout,
            })
            .collect();

        let (chain_result, exchange_results) = tokio::join!(
            double_check(&chain_source, &self.policy, logger, metrics),
            join_all(
                exchange_sources
                    .iter()
                    .map(|source| double_check(source, &self.policy, logger, metrics))
            ),
        );

        let mut outcome = CycleOutcome {
            statuses: StatusMap::new(),
            chain_balances: None,
            exchange_balances: BTreeMap::new(),
            failed_exchanges: BTreeMap::new(),
            errors: Vec::new(),
        };

        match chain_result {
            Ok(checked) => {
                outcome.statuses.extend(checked.statuses);
                outcome.chain_balances = Some(checked.balance);
            }
            Err(e) => {
                logger.log_fetch_failure("blockchain", &e.to_string(), e.is_transient());
                outcome.errors.push(format!("blockchain: {}", e));
            }
        }

        let return_time = now_millis();
        for (source, result) in exchange_sources.iter().zip(exchange_results) {
            let id = source.exchange.id();
            match result {
                Ok(checked) => {
                    for (activity, status) in checked.statuses {
                        match outcome.statuses.get_mut(&activity) {
                            Some(chain_side) => combine(chain_side, status),
                            None => {
                                outcome.statuses.insert(activity, status);
                            }
                        }
                    }
                    outcome.exchange_balances.insert(
                        id,
                        ExchangeBalanceEntry {
                            valid: true,
                            error: None,
                            timestamp: now,
                            return_time,
                            available: checked.balance.available,
                            locked: checked.balance.locked,
                            deposit: checked.balance.deposit,
                        },
                    );
                }
                Err(e) => {
                    logger.log_fetch_failure(id.as_str(), &e.to_string(), e.is_transient());
                    outcome.errors.push(format!("{}: {}", id, e));
                    outcome.failed_exchanges.insert(id, e.to_string());
                }
            }
        }

        // exchange-pending activities on exchanges nobody configured
        let orphaned: BTreeSet<&ExchangeId> = pending
            .iter()
            .filter(|r| r.is_exchange_pending())
            .filter_map(|r| r.action.exchange())
            .filter(|id| !self.exchanges.contains_key(*id))
            .collect();
        for id in orphaned {
            outcome.errors.push(format!("{}: exchange not configured", id));
        }

        for (id, status) in &outcome.statuses {
            if let Some(error) = &status.error {
                outcome.errors.push(format!("{}: {}", id, error));
            }
        }

        outcome
    }

    /// Merge statuses into records, rewrite the changed ones and return
    /// those still pending
    async fn apply(
        &self,
        pending: Vec<ActivityRecord>,
        statuses: &StatusMap,
        logger: &CycleLogger,
    ) -> (Vec<ActivityRecord>, Vec<String>) {
        let mut still_pending = Vec::with_capacity(pending.len());
        let mut errors = Vec::new();

        for mut record in pending {
            let previous_mining = record.mining_status;

            if let Some(status) = statuses.get(&record.id) {
                if merge(&mut record, status) {
                    logger.log_status_transition(
                        &record.id,
                        record.exchange_status,
                        record.mining_status,
                    );
                    self.count_transition(&record, previous_mining);

                    if let Err(e) = self.storage.put_activity(record.clone()).await {
                        warn!(activity = %record.id, error = %e, "Failed to rewrite activity");
                        errors.push(format!("{}: {}", record.id, e));
                    }
                }
            }

            if record.is_pending() {
                still_pending.push(record);
            }
        }

        (still_pending, errors)
    }

    fn count_transition(&self, record: &ActivityRecord, previous_mining: MiningStatus) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        if previous_mining == MiningStatus::Lost && record.mining_status == MiningStatus::Failed {
            metrics.lost_escalations.inc();
            info!(activity = %record.id, "Lost transaction written off as failed");
        }
        if !record.is_pending() {
            metrics
                .terminal_transitions
                .with_label_values(&[&record.kind().to_string()])
                .inc();
        }
    }
}

/// Fold the exchange-side view of an activity into its chain-side view.
/// Mining fields stay with the chain, exchange fields with the exchange.
fn combine(chain_side: &mut ActivityStatus, exchange_side: ActivityStatus) {
    chain_side.exchange_status = exchange_side.exchange_status;
    if exchange_side.fee.is_some() {
        chain_side.fee = exchange_side.fee;
    }
    if chain_side.tx_hash.is_none() {
        chain_side.tx_hash = exchange_side.tx_hash;
    }
    chain_side.error = match (chain_side.error.take(), exchange_side.error) {
        (Some(a), Some(b)) => Some(format!("{}; {}", a, b)),
        (a, b) => a.or(b),
    };
}

/// Balance entry for an exchange whose fetch failed: the last persisted
/// entry for it, tagged with the new error. A false zero would read as a
/// total loss of funds downstream.
pub fn substitute_balance(
    previous: Option<&AuthDataSnapshot>,
    exchange: &ExchangeId,
    error: &str,
    timepoint: Timepoint,
) -> ExchangeBalanceEntry {
    match previous.and_then(|p| p.exchange_balances.get(exchange)) {
        Some(entry) => ExchangeBalanceEntry {
            valid: false,
            error: Some(error.to_string()),
            ..entry.clone()
        },
        None => ExchangeBalanceEntry::invalid(error, timepoint, now_millis()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitution_keeps_previous_balances() {
        let binance = ExchangeId::from("binance");
        let mut previous = AuthDataSnapshot::default();
        previous.exchange_balances.insert(
            binance.clone(),
            ExchangeBalanceEntry {
                valid: true,
                error: None,
                timestamp: 10,
                return_time: 11,
                available: BTreeMap::from([("ETH".to_string(), 12.5)]),
                locked: BTreeMap::new(),
                deposit: BTreeMap::new(),
            },
        );

        let entry = substitute_balance(Some(&previous), &binance, "timeout", 20);
        assert!(!entry.valid);
        assert_eq!(entry.error.as_deref(), Some("timeout"));
        assert_eq!(entry.available.get("ETH"), Some(&12.5));
        assert_eq!(entry.timestamp, 10);

        let fresh = substitute_balance(None, &binance, "down", 20);
        assert!(!fresh.valid);
        assert!(fresh.available.is_empty());
    }
}
