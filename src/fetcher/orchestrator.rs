//! Periodic fetch tasks, one per domain

use super::block_state::BlockState;
use super::errors::FetchError;
use crate::collaborators::{
    Blockchain, Exchange, ReferencePriceSource, Scheduler, Storage, TaskKind,
};
use crate::config::FetcherConfig;
use crate::logging::CycleLogger;
use crate::metrics::{ReserveMetrics, Timer};
use crate::reconcile::ReconcileEngine;
use crate::types::{
    millis, now_millis, Address, AuthDataSnapshot, BlockSnapshot, Domain, DomainSnapshot,
    ExchangeBookEntry, ExchangeId, OrderBookSnapshot, RateSnapshot, ReferencePrice,
    ReferencePriceSnapshot, Timepoint,
};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

async fn with_deadline<T, E, F>(origin: &str, deadline: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<FetchError>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(FetchError::Timeout {
            origin: origin.to_string(),
            timeout_ms: millis(deadline),
        }),
    }
}

pub struct Fetcher {
    chain: Arc<dyn Blockchain>,
    exchanges: Vec<Arc<dyn Exchange>>,
    references: Vec<Arc<dyn ReferencePriceSource>>,
    storage: Arc<dyn Storage>,
    engine: Arc<ReconcileEngine>,
    block: Arc<BlockState>,
    deposit_addresses: DashMap<(ExchangeId, String), Address>,
    config: FetcherConfig,
    metrics: Option<Arc<ReserveMetrics>>,
}

impl Fetcher {
    pub fn new(
        chain: Arc<dyn Blockchain>,
        exchanges: Vec<Arc<dyn Exchange>>,
        references: Vec<Arc<dyn ReferencePriceSource>>,
        storage: Arc<dyn Storage>,
        engine: Arc<ReconcileEngine>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            chain,
            exchanges,
            references,
            storage,
            engine,
            block: Arc::new(BlockState::new()),
            deposit_addresses: DashMap::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReserveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn block_state(&self) -> Arc<BlockState> {
        self.block.clone()
    }

    fn finish_cycle(
        &self,
        logger: &CycleLogger,
        domain: Domain,
        version: u64,
        valid: bool,
        timer: &Timer,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&domain.to_string(), valid);
        }
        logger.log_snapshot_persisted(version, valid, timer.elapsed_ms());
    }

    /// Order books of every exchange; a failed exchange stays in the
    /// snapshot as an invalid entry
    #[instrument(skip(self))]
    pub async fn fetch_order_books(
        &self,
        timepoint: Timepoint,
    ) -> Result<OrderBookSnapshot, FetchError> {
        let timer = Timer::new();
        let logger = CycleLogger::new(Domain::OrderBook);
        logger.log_cycle_start(timepoint);
        let deadline = self.config.fetch_timeout();

        let results = join_all(self.exchanges.iter().map(|exchange| async move {
            let id = exchange.id();
            let result = with_deadline(id.as_str(), deadline, exchange.fetch_order_book()).await;
            (id, result)
        }))
        .await;

        let return_time = now_millis();
        let mut exchanges = BTreeMap::new();
        for (id, result) in results {
            let entry = match result {
                Ok(pairs) => ExchangeBookEntry {
                    valid: true,
                    error: None,
                    timestamp: timepoint,
                    return_time,
                    pairs,
                },
                Err(e) => {
                    logger.log_fetch_failure(id.as_str(), &e.to_string(), e.is_transient());
                    ExchangeBookEntry {
                        valid: false,
                        error: Some(e.to_string()),
                        timestamp: timepoint,
                        return_time,
                        pairs: BTreeMap::new(),
                    }
                }
            };
            exchanges.insert(id, entry);
        }

        let snapshot = OrderBookSnapshot {
            timepoint,
            valid: exchanges.values().all(|e| e.valid),
            exchanges,
        };
        let version = self
            .storage
            .put_snapshot(DomainSnapshot::OrderBook(snapshot.clone()))
            .await?;
        self.finish_cycle(&logger, Domain::OrderBook, version, snapshot.valid, &timer);
        Ok(snapshot)
    }

    /// Balances and pending activity statuses, through the reconciliation
    /// engine. With no block seen yet and none readable, an invalid
    /// snapshot is written instead.
    pub async fn fetch_auth_data(
        &self,
        timepoint: Timepoint,
    ) -> Result<AuthDataSnapshot, FetchError> {
        let block = match self.known_block(timepoint).await {
            Ok(block) => block,
            Err(e) => {
                warn!(timepoint, error = %e, "No block height for auth cycle");
                return Ok(self.engine.record_failed_cycle(timepoint, &e.to_string()).await?);
            }
        };
        Ok(self.engine.reconcile(timepoint, block).await?)
    }

    /// Last block seen, reading one from the chain if there is none yet
    async fn known_block(&self, timepoint: Timepoint) -> Result<u64, FetchError> {
        match self.block.current() {
            0 => Ok(self.fetch_block(timepoint).await?.block),
            block => Ok(block),
        }
    }

    /// On-chain rates at the current block. Returns `None` when no block has
    /// been seen yet or the height changed too recently for the rest of the
    /// system to have seen it.
    #[instrument(skip(self))]
    pub async fn fetch_rates(
        &self,
        timepoint: Timepoint,
    ) -> Result<Option<RateSnapshot>, FetchError> {
        let debounce = Duration::from_millis(self.config.rate_block_debounce_ms);
        if self.block.changed_within(debounce) {
            debug!("Block updated recently, rate fetch skipped");
            return Ok(None);
        }

        let block = self.block.current();
        if block == 0 {
            debug!("No block seen yet, rate fetch skipped");
            return Ok(None);
        }

        let timer = Timer::new();
        let logger = CycleLogger::new(Domain::Rates);
        logger.log_cycle_start(timepoint);

        let snapshot = match with_deadline(
            "blockchain",
            self.config.fetch_timeout(),
            self.chain.fetch_rates(block),
        )
        .await
        {
            Ok(rates) => RateSnapshot {
                timepoint,
                valid: true,
                error: None,
                block,
                rates,
            },
            Err(e) => {
                logger.log_fetch_failure("blockchain", &e.to_string(), e.is_transient());
                RateSnapshot {
                    timepoint,
                    valid: false,
                    error: Some(e.to_string()),
                    block,
                    rates: BTreeMap::new(),
                }
            }
        };

        let version = self
            .storage
            .put_snapshot(DomainSnapshot::Rates(snapshot.clone()))
            .await?;
        self.finish_cycle(&logger, Domain::Rates, version, snapshot.valid, &timer);
        Ok(Some(snapshot))
    }

    pub async fn fetch_block(&self, timepoint: Timepoint) -> Result<BlockSnapshot, FetchError> {
        let block = with_deadline(
            "blockchain",
            self.config.fetch_timeout(),
            self.chain.current_block(),
        )
        .await?;

        if self.block.update(block) {
            debug!(block, "New block");
            if let Some(metrics) = &self.metrics {
                metrics.current_block.set(block as i64);
            }
        }

        let snapshot = BlockSnapshot { timepoint, block };
        self.storage
            .put_snapshot(DomainSnapshot::Block(snapshot.clone()))
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&Domain::Block.to_string(), true);
        }
        Ok(snapshot)
    }

    pub async fn fetch_reference_prices(
        &self,
        timepoint: Timepoint,
    ) -> Result<ReferencePriceSnapshot, FetchError> {
        let timer = Timer::new();
        let logger = CycleLogger::new(Domain::ReferencePrices);
        logger.log_cycle_start(timepoint);
        let deadline = self.config.fetch_timeout();

        let results = join_all(self.references.iter().map(|feed| async move {
            let name = feed.name().to_string();
            let result = match tokio::time::timeout(deadline, feed.fetch_price()).await {
                Ok(Ok(price)) => Ok(price),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", millis(deadline))),
            };
            (name, result)
        }))
        .await;

        let mut feeds = BTreeMap::new();
        for (name, result) in results {
            let price = match result {
                Ok(price) => ReferencePrice {
                    valid: true,
                    error: None,
                    price,
                    timestamp: timepoint,
                },
                Err(error) => {
                    logger.log_fetch_failure(&name, &error, true);
                    ReferencePrice {
                        valid: false,
                        error: Some(error),
                        price: 0.0,
                        timestamp: timepoint,
                    }
                }
            };
            feeds.insert(name, price);
        }

        let snapshot = ReferencePriceSnapshot {
            timepoint,
            valid: feeds.values().all(|f| f.valid),
            feeds,
        };
        let version = self
            .storage
            .put_snapshot(DomainSnapshot::ReferencePrices(snapshot.clone()))
            .await?;
        self.finish_cycle(&logger, Domain::ReferencePrices, version, snapshot.valid, &timer);
        Ok(snapshot)
    }

    /// Reload deposit addresses from every exchange. A failing exchange
    /// keeps its previous entries; its error is returned.
    pub async fn refresh_deposit_addresses(&self) -> BTreeMap<ExchangeId, FetchError> {
        let deadline = self.config.fetch_timeout();
        let results = join_all(self.exchanges.iter().map(|exchange| async move {
            let id = exchange.id();
            let result = with_deadline(id.as_str(), deadline, exchange.token_addresses()).await;
            (id, result)
        }))
        .await;

        let mut failures = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(addresses) => {
                    for (asset, address) in addresses {
                        self.deposit_addresses.insert((id.clone(), asset), address);
                    }
                }
                Err(e) => {
                    warn!(exchange = %id, error = %e, "Failed to refresh deposit addresses");
                    failures.insert(id, e);
                }
            }
        }
        failures
    }

    pub fn deposit_address(&self, exchange: &ExchangeId, asset: &str) -> Option<Address> {
        self.deposit_addresses
            .get(&(exchange.clone(), asset.to_string()))
            .map(|entry| *entry)
    }

    async fn run_task(&self, task: TaskKind, timepoint: Timepoint) {
        let result = match task {
            TaskKind::OrderBook => self.fetch_order_books(timepoint).await.map(|_| ()),
            TaskKind::AuthData => self.fetch_auth_data(timepoint).await.map(|_| ()),
            TaskKind::Rates => self.fetch_rates(timepoint).await.map(|_| ()),
            TaskKind::Block => self.fetch_block(timepoint).await.map(|_| ()),
            TaskKind::ReferencePrices => self.fetch_reference_prices(timepoint).await.map(|_| ()),
        };

        if let Err(e) = result {
            warn!(
                task = %task,
                timepoint,
                error = %e,
                transient = e.is_transient(),
                "Fetch cycle failed"
            );
            if let Some(metrics) = &self.metrics {
                metrics.fetch_failures_total.with_label_values(&[&task.to_string()]).inc();
            }
        }
    }

    /// Spawn one loop per task the scheduler signals. Each loop runs its
    /// cycles one at a time and ends when the scheduler stops.
    pub fn run(self: Arc<Self>, scheduler: &dyn Scheduler) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for task in TaskKind::ALL {
            let Some(mut signal) = scheduler.signal(task) else {
                continue;
            };
            let fetcher = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(timepoint) = signal.recv().await {
                    fetcher.run_task(task, timepoint).await;
                }
                debug!(task = %task, "Signal closed, fetch loop exiting");
            }));
        }
        info!(tasks = handles.len(), "🚀 Fetch loops started");
        handles
    }
}
