//! Chain and exchange implementations of the double-check source

use super::double_check::{StatusMap, StatusSource};
use super::errors::ReconcileError;
use super::exchange_status::ExchangeResolver;
use super::mining::MiningResolver;
use crate::collaborators::{Blockchain, Exchange, ExchangeBalances, TxLookup};
use crate::nonce_manager::NonceRegistry;
use crate::types::{millis, ActivityRecord, ActivityStatus, Address, Timepoint};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

async fn with_deadline<T, E, F>(origin: &str, deadline: Duration, fut: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ReconcileError>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ReconcileError::Timeout {
            origin: origin.to_string(),
            timeout_ms: millis(deadline),
        }),
    }
}

/// Blockchain-pending activities plus the reserve's token balances
pub struct ChainSource<'a> {
    pub chain: &'a dyn Blockchain,
    pub records: Vec<&'a ActivityRecord>,
    pub resolver: &'a MiningResolver,
    pub mined_nonces: &'a NonceRegistry,
    pub reserve: Address,
    pub block: u64,
    pub now: Timepoint,
    pub call_timeout: Duration,
}

impl ChainSource<'_> {
    async fn lookup(&self, record: &ActivityRecord) -> Option<Result<TxLookup, ReconcileError>> {
        let hash = record.result.tx_hash?;
        Some(with_deadline("blockchain", self.call_timeout, self.chain.transaction_status(hash)).await)
    }
}

#[async_trait]
impl StatusSource for ChainSource<'_> {
    type Balance = BTreeMap<String, u128>;

    fn name(&self) -> String {
        "blockchain".to_string()
    }

    async fn statuses(&self) -> Result<StatusMap, ReconcileError> {
        let lookups = join_all(self.records.iter().map(|record| self.lookup(record))).await;

        // Mined nonces are only needed for operators with a lost transaction
        let lost_operators: BTreeSet<Address> = self
            .records
            .iter()
            .zip(lookups.iter())
            .filter(|(_, lookup)| matches!(lookup, Some(Ok(TxLookup::NotFound))))
            .filter_map(|(record, _)| record.result.operator)
            .collect();

        let mut mined = BTreeMap::new();
        for operator in lost_operators {
            let result = self.mined_nonces.observe(self.chain, operator).await;
            mined.insert(operator, result);
        }

        let mut statuses = StatusMap::new();
        for (record, lookup) in self.records.iter().zip(lookups) {
            let mut status = ActivityStatus::unchanged(record);
            match lookup {
                None => {}
                Some(Ok(lookup)) => {
                    let trusted = match record.result.operator.and_then(|op| mined.get(&op)) {
                        Some(Ok(nonce)) => Some(*nonce),
                        Some(Err(e)) => {
                            status.error = Some(e.to_string());
                            None
                        }
                        None => None,
                    };
                    let resolution = self.resolver.resolve(record, lookup, trusted, self.now);
                    status.mining_status = resolution.status;
                    status.block = resolution.block.or(status.block);
                }
                Some(Err(e)) => {
                    debug!(activity = %record.id, error = %e, "Transaction lookup failed");
                    status.error = Some(e.to_string());
                }
            }
            statuses.insert(record.id.clone(), status);
        }
        Ok(statuses)
    }

    async fn balance(&self) -> Result<Self::Balance, ReconcileError> {
        with_deadline(
            "blockchain",
            self.call_timeout,
            self.chain.fetch_balances(self.reserve, self.block),
        )
        .await
    }
}

/// Exchange-pending activities of one exchange plus its balances
pub struct ExchangeSource<'a> {
    pub exchange: &'a dyn Exchange,
    pub records: Vec<&'a ActivityRecord>,
    pub resolver: &'a ExchangeResolver,
    pub now: Timepoint,
    pub call_timeout: Duration,
}

#[async_trait]
impl StatusSource for ExchangeSource<'_> {
    type Balance = ExchangeBalances;

    fn name(&self) -> String {
        self.exchange.id().to_string()
    }

    async fn statuses(&self) -> Result<StatusMap, ReconcileError> {
        let resolved = join_all(
            self.records
                .iter()
                .map(|record| self.resolver.resolve(self.exchange, record, self.now)),
        )
        .await;

        Ok(self
            .records
            .iter()
            .zip(resolved)
            .map(|(record, status)| (record.id.clone(), status))
            .collect())
    }

    async fn balance(&self) -> Result<Self::Balance, ReconcileError> {
        let origin = self.name();
        with_deadline(&origin, self.call_timeout, self.exchange.fetch_balances()).await
    }
}
