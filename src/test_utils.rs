//! Test Utilities Module
//!
//! Scriptable in-memory collaborators for deterministic tests. Only
//! compiled when running tests or when the `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::collaborators::{
    AbiValue, Blockchain, ChainError, ContractCall, Exchange, ExchangeBalances, ExchangeError,
    MemoryStorage, ReferenceError, ReferencePriceSource, Scheduler, SignedTx, Storage,
    StorageError, TaskKind, TickReceiver, TxLookup, UnsignedTx, WithdrawStatus,
};
use crate::rpc_manager::{BroadcastNode, RpcError};
use crate::types::{
    ActivityId, ActivityRecord, Address, Domain, DomainSnapshot, ExchangeId, ExchangeOrderBook,
    ExchangeStatus, Timepoint, TokenRate, TxHash, Version,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Pop the next scripted value; the last one repeats forever
fn next_scripted<T: Copy>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().copied()
    }
}

/// Deterministic hash for a signed transaction
pub fn tx_hash_for(operator: Address, nonce: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[..20].copy_from_slice(operator.as_slice());
    bytes[24..].copy_from_slice(&nonce.to_be_bytes());
    TxHash::from(bytes)
}

#[derive(Default)]
struct ChainState {
    block: u64,
    block_error: Option<ChainError>,
    tx_status: HashMap<TxHash, VecDeque<TxLookup>>,
    balances: BTreeMap<String, u128>,
    balance_error: Option<ChainError>,
    rates: BTreeMap<Address, TokenRate>,
    mined: HashMap<Address, u64>,
    pending: HashMap<Address, u64>,
    slots: HashMap<Address, (u128, u128)>,
    built: Vec<ContractCall>,
    balance_calls: usize,
    status_calls: usize,
    fail_build: bool,
}

/// Blockchain with scripted answers
#[derive(Default)]
pub struct MockBlockchain {
    state: Mutex<ChainState>,
}

impl MockBlockchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block(&self, block: u64) {
        self.state.lock().block = block;
    }

    /// Answers for successive lookups of `hash`; the last one repeats
    pub fn script_tx(&self, hash: TxHash, lookups: impl IntoIterator<Item = TxLookup>) {
        self.state.lock().tx_status.insert(hash, lookups.into_iter().collect());
    }

    pub fn set_balance(&self, asset: &str, amount: u128) {
        self.state.lock().balances.insert(asset.to_string(), amount);
    }

    pub fn fail_block(&self, error: Option<ChainError>) {
        self.state.lock().block_error = error;
    }

    pub fn fail_balances(&self, error: Option<ChainError>) {
        self.state.lock().balance_error = error;
    }

    pub fn set_rate(&self, token: Address, rate: TokenRate) {
        self.state.lock().rates.insert(token, rate);
    }

    pub fn set_mined_nonce(&self, operator: Address, nonce: u64) {
        self.state.lock().mined.insert(operator, nonce);
    }

    pub fn set_pending_nonce(&self, operator: Address, nonce: u64) {
        self.state.lock().pending.insert(operator, nonce);
    }

    /// Compact-data slot answered by `getCompactData(token)`
    pub fn set_slot(&self, token: Address, bulk_index: u128, index_in_bulk: u128) {
        self.state.lock().slots.insert(token, (bulk_index, index_in_bulk));
    }

    pub fn fail_build(&self, fail: bool) {
        self.state.lock().fail_build = fail;
    }

    /// Calls passed to `build_transaction`, oldest first
    pub fn built_calls(&self) -> Vec<ContractCall> {
        self.state.lock().built.clone()
    }

    pub fn balance_calls(&self) -> usize {
        self.state.lock().balance_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }
}

#[async_trait]
impl Blockchain for MockBlockchain {
    async fn current_block(&self) -> Result<u64, ChainError> {
        let state = self.state.lock();
        match &state.block_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.block),
        }
    }

    async fn transaction_status(&self, hash: TxHash) -> Result<TxLookup, ChainError> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        Ok(state
            .tx_status
            .get_mut(&hash)
            .and_then(|script| next_scripted(script))
            .unwrap_or(TxLookup::NotFound))
    }

    async fn fetch_balances(
        &self,
        _address: Address,
        _at_block: u64,
    ) -> Result<BTreeMap<String, u128>, ChainError> {
        let mut state = self.state.lock();
        state.balance_calls += 1;
        match &state.balance_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.balances.clone()),
        }
    }

    async fn fetch_rates(
        &self,
        _at_block: u64,
    ) -> Result<BTreeMap<Address, TokenRate>, ChainError> {
        Ok(self.state.lock().rates.clone())
    }

    async fn mined_nonce(&self, operator: Address) -> Result<u64, ChainError> {
        self.state
            .lock()
            .mined
            .get(&operator)
            .copied()
            .ok_or_else(|| ChainError::rpc(format!("no mined nonce for {}", operator)))
    }

    async fn pending_nonce(&self, operator: Address) -> Result<u64, ChainError> {
        self.state
            .lock()
            .pending
            .get(&operator)
            .copied()
            .ok_or_else(|| ChainError::rpc(format!("no pending nonce for {}", operator)))
    }

    async fn call(&self, call: &ContractCall) -> Result<Vec<AbiValue>, ChainError> {
        let token = match call.args.first() {
            Some(AbiValue::Address(token)) if call.method == "getCompactData" => *token,
            _ => return Err(ChainError::Decode(format!("unsupported call {}", call.method))),
        };
        let (bulk, index) = self
            .state
            .lock()
            .slots
            .get(&token)
            .copied()
            .ok_or_else(|| ChainError::rpc(format!("token {} not listed", token)))?;
        Ok(vec![
            AbiValue::Uint(bulk),
            AbiValue::Uint(index),
            AbiValue::Uint(0),
            AbiValue::Uint(0),
        ])
    }

    async fn build_transaction(
        &self,
        call: &ContractCall,
        nonce: u64,
        gas_price: u128,
    ) -> Result<UnsignedTx, ChainError> {
        let mut state = self.state.lock();
        if state.fail_build {
            return Err(ChainError::rpc("gas estimation failed"));
        }
        state.built.push(call.clone());
        Ok(UnsignedTx {
            call: call.clone(),
            nonce,
            gas_price,
            data: call.method.as_bytes().to_vec(),
        })
    }

    async fn sign(&self, tx: UnsignedTx, operator: Address) -> Result<SignedTx, ChainError> {
        Ok(SignedTx {
            hash: tx_hash_for(operator, tx.nonce),
            nonce: tx.nonce,
            raw: tx.data,
        })
    }
}

#[derive(Default)]
struct ExchangeState {
    order_book: ExchangeOrderBook,
    balances: ExchangeBalances,
    down: bool,
    statuses: HashMap<String, VecDeque<ExchangeStatus>>,
    withdraw_tx: HashMap<String, TxHash>,
    addresses: BTreeMap<String, Address>,
    balance_calls: usize,
}

/// Exchange with scripted answers. Activity statuses are keyed by order id
/// (trades), tx hash (deposits) or withdraw id (withdrawals).
pub struct MockExchange {
    id: ExchangeId,
    state: Mutex<ExchangeState>,
}

impl MockExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExchangeId::from(id),
            state: Mutex::new(ExchangeState::default()),
        }
    }

    /// Every call fails while the exchange is down
    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    pub fn set_order_book(&self, book: ExchangeOrderBook) {
        self.state.lock().order_book = book;
    }

    pub fn set_available(&self, asset: &str, amount: f64) {
        self.state
            .lock()
            .balances
            .available
            .insert(asset.to_string(), amount);
    }

    pub fn script_status(&self, key: &str, statuses: impl IntoIterator<Item = ExchangeStatus>) {
        self.state
            .lock()
            .statuses
            .insert(key.to_string(), statuses.into_iter().collect());
    }

    pub fn set_withdraw_tx(&self, withdraw_id: &str, hash: TxHash) {
        self.state.lock().withdraw_tx.insert(withdraw_id.to_string(), hash);
    }

    pub fn set_deposit_address(&self, asset: &str, address: Address) {
        self.state.lock().addresses.insert(asset.to_string(), address);
    }

    pub fn balance_calls(&self) -> usize {
        self.state.lock().balance_calls
    }

    fn check_up(&self) -> Result<(), ExchangeError> {
        if self.state.lock().down {
            return Err(ExchangeError::Api {
                exchange: self.id.to_string(),
                message: "503 service unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn status(&self, key: &str) -> Result<ExchangeStatus, ExchangeError> {
        self.check_up()?;
        self.state
            .lock()
            .statuses
            .get_mut(key)
            .and_then(|script| next_scripted(script))
            .ok_or_else(|| ExchangeError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn id(&self) -> ExchangeId {
        self.id.clone()
    }

    async fn fetch_order_book(&self) -> Result<ExchangeOrderBook, ExchangeError> {
        self.check_up()?;
        Ok(self.state.lock().order_book.clone())
    }

    async fn fetch_balances(&self) -> Result<ExchangeBalances, ExchangeError> {
        self.check_up()?;
        let mut state = self.state.lock();
        state.balance_calls += 1;
        Ok(state.balances.clone())
    }

    async fn order_status(
        &self,
        order_id: &str,
        _base: &str,
        _quote: &str,
    ) -> Result<ExchangeStatus, ExchangeError> {
        self.status(order_id)
    }

    async fn deposit_status(
        &self,
        _id: &ActivityId,
        tx_hash: TxHash,
        _asset: &str,
        _amount: f64,
        _timepoint: Timepoint,
    ) -> Result<ExchangeStatus, ExchangeError> {
        self.status(&tx_hash.to_string())
    }

    async fn withdraw_status(
        &self,
        withdraw_id: &str,
        _asset: &str,
        _amount: f64,
        _timepoint: Timepoint,
    ) -> Result<WithdrawStatus, ExchangeError> {
        let status = self.status(withdraw_id)?;
        Ok(WithdrawStatus {
            status,
            tx_hash: self.state.lock().withdraw_tx.get(withdraw_id).copied(),
            fee: None,
        })
    }

    async fn token_addresses(&self) -> Result<BTreeMap<String, Address>, ExchangeError> {
        self.check_up()?;
        Ok(self.state.lock().addresses.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    Accept,
    Reject,
    Unreachable,
    /// Never answers within any sane timeout
    Hang,
}

pub struct MockNode {
    id: String,
    behavior: Mutex<NodeBehavior>,
    sent: AtomicUsize,
}

impl MockNode {
    pub fn new(id: &str, behavior: NodeBehavior) -> Self {
        Self {
            id: id.to_string(),
            behavior: Mutex::new(behavior),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: NodeBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BroadcastNode for MockNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_raw_transaction(&self, tx: &SignedTx) -> Result<TxHash, RpcError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let behavior = *self.behavior.lock();
        match behavior {
            NodeBehavior::Accept => Ok(tx.hash),
            NodeBehavior::Reject => Err(RpcError::Rejected {
                node: self.id.clone(),
                message: "nonce too low".to_string(),
            }),
            NodeBehavior::Unreachable => Err(RpcError::Transport {
                node: self.id.clone(),
                message: "connection refused".to_string(),
            }),
            NodeBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(tx.hash)
            }
        }
    }
}

/// Scheduler driven by hand from the test body
#[derive(Default)]
pub struct ManualScheduler {
    senders: Mutex<HashMap<TaskKind, mpsc::Sender<Timepoint>>>,
    receivers: Mutex<HashMap<TaskKind, TickReceiver>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        let scheduler = Self::default();
        for task in TaskKind::ALL {
            let (tx, rx) = mpsc::channel(8);
            scheduler.senders.lock().insert(task, tx);
            scheduler.receivers.lock().insert(task, rx);
        }
        scheduler
    }

    /// Emit one tick; false once stopped
    pub async fn tick(&self, task: TaskKind, timepoint: Timepoint) -> bool {
        let sender = self.senders.lock().get(&task).cloned();
        match sender {
            Some(tx) => tx.send(timepoint).await.is_ok(),
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn signal(&self, task: TaskKind) -> Option<TickReceiver> {
        self.receivers.lock().remove(&task)
    }

    fn start(&self) {}

    fn stop(&self) {
        self.senders.lock().clear();
    }
}

pub struct StaticReferenceSource {
    name: String,
    price: Option<f64>,
}

impl StaticReferenceSource {
    pub fn new(name: &str, price: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            price,
        }
    }
}

#[async_trait]
impl ReferencePriceSource for StaticReferenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_price(&self) -> Result<f64, ReferenceError> {
        self.price.ok_or_else(|| ReferenceError::Unavailable {
            feed: self.name.clone(),
            message: "feed offline".to_string(),
        })
    }
}

/// In-memory storage that fails chosen calls on demand
#[derive(Default)]
pub struct FaultyStorage {
    inner: MemoryStorage,
    failing_activity_writes: AtomicUsize,
    activity_writes: AtomicUsize,
    version_error: Mutex<Option<StorageError>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` activity writes with a backend error
    pub fn fail_activity_writes(&self, times: usize) {
        self.failing_activity_writes.store(times, Ordering::SeqCst);
    }

    /// Answer every version lookup with `error` until cleared
    pub fn fail_version_reads(&self, error: Option<StorageError>) {
        *self.version_error.lock() = error;
    }

    /// Activity writes attempted, failed ones included
    pub fn activity_writes(&self) -> usize {
        self.activity_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn put_snapshot(&self, snapshot: DomainSnapshot) -> Result<Version, StorageError> {
        self.inner.put_snapshot(snapshot).await
    }

    async fn current_version(
        &self,
        domain: Domain,
        timepoint: Timepoint,
    ) -> Result<Version, StorageError> {
        let error = self.version_error.lock().clone();
        match error {
            Some(e) => Err(e),
            None => self.inner.current_version(domain, timepoint).await,
        }
    }

    async fn get_snapshot(
        &self,
        domain: Domain,
        version: Version,
    ) -> Result<DomainSnapshot, StorageError> {
        self.inner.get_snapshot(domain, version).await
    }

    async fn put_activity(&self, record: ActivityRecord) -> Result<(), StorageError> {
        self.activity_writes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_activity_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.put_activity(record).await
    }

    async fn get_activity(&self, id: &ActivityId) -> Result<ActivityRecord, StorageError> {
        self.inner.get_activity(id).await
    }

    async fn pending_activities(&self) -> Result<Vec<ActivityRecord>, StorageError> {
        self.inner.pending_activities().await
    }

    async fn activities_in_range(
        &self,
        from: Timepoint,
        to: Timepoint,
    ) -> Result<Vec<ActivityRecord>, StorageError> {
        self.inner.activities_in_range(from, to).await
    }
}
