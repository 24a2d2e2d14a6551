//! Subscriber setup and the fixed per-cycle log events

use crate::observability::CycleId;
use crate::types::{ActivityId, Domain, ExchangeStatus, MiningStatus, Version};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// verbosity flag.
pub fn init_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "reserve_core=debug,info"
    } else {
        "reserve_core=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// Emits the per-cycle events with the cycle id attached
#[derive(Debug, Clone)]
pub struct CycleLogger {
    cycle_id: CycleId,
    domain: Domain,
}

impl CycleLogger {
    pub fn new(domain: Domain) -> Self {
        Self {
            cycle_id: CycleId::new(),
            domain,
        }
    }

    pub fn cycle_id(&self) -> &CycleId {
        &self.cycle_id
    }

    pub fn log_cycle_start(&self, timepoint: u64) {
        tracing::debug!(
            cycle_id = %self.cycle_id,
            domain = %self.domain,
            timepoint,
            "Cycle started"
        );
    }

    pub fn log_snapshot_persisted(&self, version: Version, valid: bool, latency_ms: u64) {
        tracing::info!(
            cycle_id = %self.cycle_id,
            domain = %self.domain,
            version,
            valid,
            latency_ms,
            "Snapshot persisted"
        );
    }

    pub fn log_fetch_failure(&self, source: &str, error: &str, transient: bool) {
        tracing::warn!(
            cycle_id = %self.cycle_id,
            domain = %self.domain,
            source = %source,
            error = %error,
            transient,
            "Fetch failed"
        );
    }

    pub fn log_double_check_retry(&self, source: &str, round: u32) {
        tracing::debug!(
            cycle_id = %self.cycle_id,
            source = %source,
            round,
            "Statuses moved during balance fetch, retrying"
        );
    }

    pub fn log_status_transition(
        &self,
        id: &ActivityId,
        exchange_status: ExchangeStatus,
        mining_status: MiningStatus,
    ) {
        tracing::info!(
            cycle_id = %self.cycle_id,
            activity = %id,
            exchange_status = ?exchange_status,
            mining_status = ?mining_status,
            "Activity status changed"
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            cycle_id = %self.cycle_id,
            domain = %self.domain,
            message = %message,
            "Cycle error"
        );
    }
}
