//! Common types shared by the fetch, reconcile and rate-setting layers
//!
//! Timepoints are milliseconds since the Unix epoch. Snapshot versions are
//! the timepoint the snapshot was taken at.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use alloy_primitives::{Address, B256 as TxHash};

/// Milliseconds since the Unix epoch
pub type Timepoint = u64;

/// Snapshot version (the creation timepoint)
pub type Version = u64;

/// Current wall-clock timepoint
pub fn now_millis() -> Timepoint {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Convert a duration to a millisecond span comparable with timepoints
pub fn millis(d: std::time::Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Exchange identity (e.g. "binance", "huobi")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Composite activity identity: submission time plus an exchange- or
/// chain-side id (order id, withdraw id, tx hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId {
    pub timepoint: Timepoint,
    pub eid: String,
}

impl ActivityId {
    pub fn new(timepoint: Timepoint, eid: impl Into<String>) -> Self {
        Self {
            timepoint,
            eid: eid.into(),
        }
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.timepoint, self.eid)
    }
}

/// Blockchain side of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiningStatus {
    /// No on-chain transaction belongs to this activity
    Unset,
    Submitted,
    Pending,
    Mined,
    Failed,
    /// Node has no record of the transaction
    Lost,
}

impl MiningStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            MiningStatus::Submitted | MiningStatus::Pending | MiningStatus::Lost
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MiningStatus::Mined | MiningStatus::Failed)
    }
}

/// Exchange side of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    /// The activity has no exchange leg
    Unset,
    Submitted,
    Pending,
    Done,
    Failed,
    Cancelled,
}

impl ExchangeStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ExchangeStatus::Submitted | ExchangeStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeStatus::Done | ExchangeStatus::Failed | ExchangeStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Action kind, used for dispatch and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Trade,
    Deposit,
    Withdraw,
    SetRates,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Trade => "trade",
            ActionKind::Deposit => "deposit",
            ActionKind::Withdraw => "withdraw",
            ActionKind::SetRates => "set_rates",
        };
        f.write_str(s)
    }
}

/// Typed parameters of a requested operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Trade {
        exchange: ExchangeId,
        base: String,
        quote: String,
        side: TradeSide,
        rate: f64,
        amount: f64,
        order_id: String,
    },
    Deposit {
        exchange: ExchangeId,
        asset: String,
        amount: f64,
    },
    Withdraw {
        exchange: ExchangeId,
        asset: String,
        amount: f64,
        withdraw_id: String,
    },
    SetRates {
        tokens: Vec<Address>,
        buys: Vec<u128>,
        sells: Vec<u128>,
        block: u64,
    },
}

impl ActivityAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActivityAction::Trade { .. } => ActionKind::Trade,
            ActivityAction::Deposit { .. } => ActionKind::Deposit,
            ActivityAction::Withdraw { .. } => ActionKind::Withdraw,
            ActivityAction::SetRates { .. } => ActionKind::SetRates,
        }
    }

    /// Exchange this action touches, if any
    pub fn exchange(&self) -> Option<&ExchangeId> {
        match self {
            ActivityAction::Trade { exchange, .. }
            | ActivityAction::Deposit { exchange, .. }
            | ActivityAction::Withdraw { exchange, .. } => Some(exchange),
            ActivityAction::SetRates { .. } => None,
        }
    }
}

/// Typed results accumulated over an activity's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    /// Signing operator of the on-chain transaction
    pub operator: Option<Address>,
    pub tx_hash: Option<TxHash>,
    pub nonce: Option<u64>,
    pub gas_price: Option<u128>,
    pub block: Option<u64>,
    pub fee: Option<f64>,
    pub error: Option<String>,
}

/// One requested operation and its reconciled state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    /// Exchange id, or "blockchain" for chain-only actions
    pub destination: String,
    pub action: ActivityAction,
    pub result: ActivityResult,
    pub exchange_status: ExchangeStatus,
    pub mining_status: MiningStatus,
    pub created_at: Timepoint,
}

pub const CHAIN_DESTINATION: &str = "blockchain";

impl ActivityRecord {
    pub fn new_trade(
        timepoint: Timepoint,
        exchange: ExchangeId,
        base: &str,
        quote: &str,
        side: TradeSide,
        rate: f64,
        amount: f64,
        order_id: &str,
    ) -> Self {
        Self {
            id: ActivityId::new(timepoint, format!("{}_{}", order_id, exchange)),
            destination: exchange.to_string(),
            action: ActivityAction::Trade {
                exchange,
                base: base.to_string(),
                quote: quote.to_string(),
                side,
                rate,
                amount,
                order_id: order_id.to_string(),
            },
            result: ActivityResult::default(),
            exchange_status: ExchangeStatus::Submitted,
            mining_status: MiningStatus::Unset,
            created_at: timepoint,
        }
    }

    pub fn new_deposit(
        timepoint: Timepoint,
        exchange: ExchangeId,
        asset: &str,
        amount: f64,
        operator: Address,
        tx_hash: TxHash,
        nonce: u64,
        gas_price: u128,
    ) -> Self {
        Self {
            id: ActivityId::new(timepoint, tx_hash.to_string()),
            destination: exchange.to_string(),
            action: ActivityAction::Deposit {
                exchange,
                asset: asset.to_string(),
                amount,
            },
            result: ActivityResult {
                operator: Some(operator),
                tx_hash: Some(tx_hash),
                nonce: Some(nonce),
                gas_price: Some(gas_price),
                ..ActivityResult::default()
            },
            exchange_status: ExchangeStatus::Submitted,
            mining_status: MiningStatus::Submitted,
            created_at: timepoint,
        }
    }

    pub fn new_withdraw(
        timepoint: Timepoint,
        exchange: ExchangeId,
        asset: &str,
        amount: f64,
        withdraw_id: &str,
    ) -> Self {
        Self {
            id: ActivityId::new(timepoint, format!("{}_{}", withdraw_id, exchange)),
            destination: exchange.to_string(),
            action: ActivityAction::Withdraw {
                exchange,
                asset: asset.to_string(),
                amount,
                withdraw_id: withdraw_id.to_string(),
            },
            result: ActivityResult::default(),
            exchange_status: ExchangeStatus::Submitted,
            mining_status: MiningStatus::Unset,
            created_at: timepoint,
        }
    }

    pub fn new_set_rates(
        timepoint: Timepoint,
        tokens: Vec<Address>,
        buys: Vec<u128>,
        sells: Vec<u128>,
        block: u64,
        operator: Address,
        tx_hash: TxHash,
        nonce: u64,
        gas_price: u128,
    ) -> Self {
        Self {
            id: ActivityId::new(timepoint, tx_hash.to_string()),
            destination: CHAIN_DESTINATION.to_string(),
            action: ActivityAction::SetRates {
                tokens,
                buys,
                sells,
                block,
            },
            result: ActivityResult {
                operator: Some(operator),
                tx_hash: Some(tx_hash),
                nonce: Some(nonce),
                gas_price: Some(gas_price),
                ..ActivityResult::default()
            },
            exchange_status: ExchangeStatus::Unset,
            mining_status: MiningStatus::Submitted,
            created_at: timepoint,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn is_blockchain_pending(&self) -> bool {
        self.mining_status.is_pending()
    }

    pub fn is_exchange_pending(&self) -> bool {
        self.exchange_status.is_pending()
    }

    /// Still belongs in the pending index
    pub fn is_pending(&self) -> bool {
        self.is_blockchain_pending() || self.is_exchange_pending()
    }
}

/// Per-cycle reconciliation output for one activity. Never persisted on its
/// own; merged into the matching [`ActivityRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatus {
    pub exchange_status: ExchangeStatus,
    pub mining_status: MiningStatus,
    pub tx_hash: Option<TxHash>,
    pub block: Option<u64>,
    pub fee: Option<f64>,
    pub error: Option<String>,
}

impl ActivityStatus {
    /// Status equal to what the record already holds
    pub fn unchanged(record: &ActivityRecord) -> Self {
        Self {
            exchange_status: record.exchange_status,
            mining_status: record.mining_status,
            tx_hash: record.result.tx_hash,
            block: record.result.block,
            fee: record.result.fee,
            error: None,
        }
    }

    /// Fields the double-check protocol compares
    pub fn consistency_key(&self) -> (ExchangeStatus, MiningStatus, Option<TxHash>) {
        (self.exchange_status, self.mining_status, self.tx_hash)
    }
}

/// Balances an exchange reported, or the reason it could not
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeBalanceEntry {
    pub valid: bool,
    pub error: Option<String>,
    pub timestamp: Timepoint,
    pub return_time: Timepoint,
    pub available: BTreeMap<String, f64>,
    pub locked: BTreeMap<String, f64>,
    pub deposit: BTreeMap<String, f64>,
}

impl ExchangeBalanceEntry {
    pub fn invalid(error: impl Into<String>, timestamp: Timepoint, return_time: Timepoint) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            timestamp,
            return_time,
            ..Self::default()
        }
    }
}

/// Versioned consolidated view of chain and exchange balances plus the
/// activities still in flight. Immutable once written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthDataSnapshot {
    pub timepoint: Timepoint,
    pub valid: bool,
    pub error: Option<String>,
    pub block: u64,
    pub chain_balances: BTreeMap<String, u128>,
    pub exchange_balances: BTreeMap<ExchangeId, ExchangeBalanceEntry>,
    pub pending_activities: Vec<ActivityRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub rate: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Order books of one exchange keyed by pair ("KNC-ETH")
pub type ExchangeOrderBook = BTreeMap<String, PairBook>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeBookEntry {
    pub valid: bool,
    pub error: Option<String>,
    pub timestamp: Timepoint,
    pub return_time: Timepoint,
    pub pairs: ExchangeOrderBook,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub timepoint: Timepoint,
    pub valid: bool,
    pub exchanges: BTreeMap<ExchangeId, ExchangeBookEntry>,
}

/// On-chain rate of one token: full-precision base plus compact delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRate {
    pub base_buy: u128,
    pub compact_buy: i8,
    pub base_sell: u128,
    pub compact_sell: i8,
    pub block: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub timepoint: Timepoint,
    pub valid: bool,
    pub error: Option<String>,
    pub block: u64,
    pub rates: BTreeMap<Address, TokenRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub timepoint: Timepoint,
    pub block: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePrice {
    pub valid: bool,
    pub error: Option<String>,
    pub price: f64,
    pub timestamp: Timepoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePriceSnapshot {
    pub timepoint: Timepoint,
    pub valid: bool,
    pub feeds: BTreeMap<String, ReferencePrice>,
}

/// Storage domain of a versioned snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    OrderBook,
    Auth,
    Rates,
    Block,
    ReferencePrices,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::OrderBook => "order_book",
            Domain::Auth => "auth",
            Domain::Rates => "rates",
            Domain::Block => "block",
            Domain::ReferencePrices => "reference_prices",
        };
        f.write_str(s)
    }
}

/// A snapshot of any domain, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainSnapshot {
    OrderBook(OrderBookSnapshot),
    Auth(AuthDataSnapshot),
    Rates(RateSnapshot),
    Block(BlockSnapshot),
    ReferencePrices(ReferencePriceSnapshot),
}

impl DomainSnapshot {
    pub fn domain(&self) -> Domain {
        match self {
            DomainSnapshot::OrderBook(_) => Domain::OrderBook,
            DomainSnapshot::Auth(_) => Domain::Auth,
            DomainSnapshot::Rates(_) => Domain::Rates,
            DomainSnapshot::Block(_) => Domain::Block,
            DomainSnapshot::ReferencePrices(_) => Domain::ReferencePrices,
        }
    }

    pub fn timepoint(&self) -> Timepoint {
        match self {
            DomainSnapshot::OrderBook(s) => s.timepoint,
            DomainSnapshot::Auth(s) => s.timepoint,
            DomainSnapshot::Rates(s) => s.timepoint,
            DomainSnapshot::Block(s) => s.timepoint,
            DomainSnapshot::ReferencePrices(s) => s.timepoint,
        }
    }
}
