//! Set-rate submission
//!
//! Turns desired token rates into one `ConversionRates` transaction, sends
//! it through every broadcast node and records it as a pending activity.

use crate::collaborators::{Blockchain, ChainError, Storage, StorageError};
use crate::config::ReserveSection;
use crate::nonce_manager::{NonceError, NonceRegistry};
use crate::rate_codec::{CodecError, RateTarget, SetRatePlan, TokenIndexTable};
use crate::rpc_manager::{Broadcaster, RpcError};
use crate::types::{millis, ActivityRecord, Address, Timepoint};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(7);
pub(crate) const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SetRateError {
    #[error("No rate targets given")]
    EmptyBatch,

    #[error("Gas price {gas_price} wei above ceiling {ceiling} wei")]
    GasPriceTooHigh { gas_price: u128, ceiling: u128 },

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{origin} timed out after {timeout_ms}ms")]
    Timeout { origin: String, timeout_ms: u64 },

    /// Every node refused or missed the transaction; nothing was recorded
    #[error("Transaction not accepted by any node ({} errors)", .errors.len())]
    NotBroadcast { errors: BTreeMap<String, RpcError> },
}

impl SetRateError {
    pub fn is_transient(&self) -> bool {
        match self {
            SetRateError::Codec(e) => e.is_transient(),
            SetRateError::Chain(e) => e.is_transient(),
            SetRateError::Nonce(e) => e.is_transient(),
            SetRateError::Timeout { .. } => true,
            SetRateError::NotBroadcast { errors } => errors.values().any(RpcError::is_transient),
            _ => false,
        }
    }
}

pub struct RateSetter {
    chain: Arc<dyn Blockchain>,
    storage: Arc<dyn Storage>,
    broadcaster: Arc<Broadcaster>,
    nonces: Arc<NonceRegistry>,
    table: RwLock<TokenIndexTable>,
    operator: Address,
    gas_price: RwLock<u128>,
    max_gas_price: u128,
    call_timeout: Duration,
}

impl RateSetter {
    /// `nonces` must be a registry fed with pending nonces
    pub fn new(
        chain: Arc<dyn Blockchain>,
        storage: Arc<dyn Storage>,
        broadcaster: Arc<Broadcaster>,
        nonces: Arc<NonceRegistry>,
        reserve: &ReserveSection,
    ) -> Result<Self, SetRateError> {
        let operator = reserve
            .operator(&reserve.pricing_operator)
            .ok_or_else(|| SetRateError::UnknownOperator(reserve.pricing_operator.clone()))?;

        Ok(Self {
            chain,
            storage,
            broadcaster,
            nonces,
            table: RwLock::new(TokenIndexTable::new()),
            operator,
            gas_price: RwLock::new(reserve.gas_price_wei()),
            max_gas_price: reserve.max_gas_price_wei(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    pub fn set_gas_price(&self, wei: u128) {
        *self.gas_price.write() = wei;
    }

    pub fn token_count(&self) -> usize {
        self.table.read().len()
    }

    /// Replace the slot table with a fresh read from the contract. The old
    /// table stays in place if the read fails.
    pub async fn reload_token_indices(&self, tokens: &[Address]) -> Result<usize, SetRateError> {
        let table = TokenIndexTable::load(self.chain.as_ref(), tokens).await?;
        let count = table.len();
        *self.table.write() = table;
        info!(tokens = count, "Token slot table loaded");
        Ok(count)
    }

    async fn deadline<T, E, F>(&self, origin: &str, fut: F) -> Result<T, SetRateError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<SetRateError>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SetRateError::Timeout {
                origin: origin.to_string(),
                timeout_ms: millis(self.call_timeout),
            }),
        }
    }

    /// Store a record for a transaction already on the wire, up to
    /// `RECORD_ATTEMPTS` tries
    async fn record_activity(&self, record: &ActivityRecord) -> Result<(), StorageError> {
        let mut attempt = 1;
        loop {
            let write = self.storage.put_activity(record.clone());
            let result = match tokio::time::timeout(self.call_timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Backend(format!(
                    "activity write timed out after {}ms",
                    millis(self.call_timeout)
                ))),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(
                        activity = %record.id,
                        attempt,
                        error = %e,
                        "Activity write failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(RECORD_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit `targets` as a single transaction and record it. On success
    /// the returned record is already persisted with mining status
    /// `submitted`.
    #[instrument(skip(self, targets), fields(tokens = targets.len()))]
    pub async fn set_rates(
        &self,
        targets: &[RateTarget],
        timepoint: Timepoint,
    ) -> Result<ActivityRecord, SetRateError> {
        if targets.is_empty() {
            return Err(SetRateError::EmptyBatch);
        }

        let gas_price = *self.gas_price.read();
        if gas_price > self.max_gas_price {
            return Err(SetRateError::GasPriceTooHigh {
                gas_price,
                ceiling: self.max_gas_price,
            });
        }

        let block = self.deadline("blockchain", self.chain.current_block()).await?;
        let current = self.deadline("blockchain", self.chain.fetch_rates(block)).await?;

        let plan = {
            let table = self.table.read();
            SetRatePlan::build(targets, &current, &table, block)?
        };
        if plan.needs_base_update() {
            info!(rebased = plan.base_updates.len(), "Compact overflow, updating base rates");
        }
        for (i, index) in plan.bulk.indices.iter().enumerate() {
            debug!(
                bulk = index,
                buys = %hex::encode(plan.bulk.buys[i]),
                sells = %hex::encode(plan.bulk.sells[i]),
                "Packed compact word"
            );
        }
        let call = plan.to_call();

        let lease = self.nonces.lease(self.chain.as_ref(), self.operator).await?;
        let nonce = lease.nonce();

        let unsigned = self
            .deadline("blockchain", self.chain.build_transaction(&call, nonce, gas_price))
            .await?;
        let signed = self
            .deadline("blockchain", self.chain.sign(unsigned, self.operator))
            .await?;

        let outcome = self.broadcaster.broadcast(&signed).await;
        if !outcome.succeeded {
            warn!(nonce, hash = %signed.hash, "Set-rate transaction not accepted, nonce released");
            return Err(SetRateError::NotBroadcast {
                errors: outcome.errors,
            });
        }
        lease.commit();

        let record = ActivityRecord::new_set_rates(
            timepoint,
            targets.iter().map(|t| t.token).collect(),
            targets.iter().map(|t| t.buy).collect(),
            targets.iter().map(|t| t.sell).collect(),
            block,
            self.operator,
            signed.hash,
            nonce,
            gas_price,
        );
        if let Err(source) = self.record_activity(&record).await {
            error!(
                activity = %record.id,
                hash = %signed.hash,
                nonce,
                error = %source,
                "Set-rate transaction broadcast but not recorded"
            );
            return Err(SetRateError::NotRecorded {
                record: Box::new(record),
                source,
            });
        }

        info!(
            activity = %record.id,
            hash = %signed.hash,
            nonce,
            block,
            accepted = outcome.accepted.len(),
            "💱 Rates submitted"
        );
        Ok(record)
    }
}
