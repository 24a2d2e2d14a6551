//! Exchange collaborator, one implementation per exchange

use crate::types::{ActivityId, Address, ExchangeId, ExchangeOrderBook, ExchangeStatus, Timepoint, TxHash};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeBalances {
    pub available: BTreeMap<String, f64>,
    pub locked: BTreeMap<String, f64>,
    pub deposit: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawStatus {
    pub status: ExchangeStatus,
    pub tx_hash: Option<TxHash>,
    pub fee: Option<f64>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("Exchange API error: {message} (exchange: {exchange})")]
    Api { exchange: String, message: String },

    #[error("Timeout after {timeout_ms}ms (exchange: {exchange})")]
    Timeout { exchange: String, timeout_ms: u64 },

    #[error("Not found on exchange: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Api { .. } | ExchangeError::Timeout { .. }
        )
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> ExchangeId;

    async fn fetch_order_book(&self) -> Result<ExchangeOrderBook, ExchangeError>;

    async fn fetch_balances(&self) -> Result<ExchangeBalances, ExchangeError>;

    async fn order_status(
        &self,
        order_id: &str,
        base: &str,
        quote: &str,
    ) -> Result<ExchangeStatus, ExchangeError>;

    async fn deposit_status(
        &self,
        id: &ActivityId,
        tx_hash: TxHash,
        asset: &str,
        amount: f64,
        timepoint: Timepoint,
    ) -> Result<ExchangeStatus, ExchangeError>;

    async fn withdraw_status(
        &self,
        withdraw_id: &str,
        asset: &str,
        amount: f64,
        timepoint: Timepoint,
    ) -> Result<WithdrawStatus, ExchangeError>;

    /// Deposit addresses per asset
    async fn token_addresses(&self) -> Result<BTreeMap<String, Address>, ExchangeError>;
}
