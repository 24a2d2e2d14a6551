//! Configuration for the reserve core
//!
//! Loaded from TOML. Every tunable has a `default_*` function so a minimal
//! file only needs the node list and the reserve section.

use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const GWEI: u128 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveConfig {
    /// Broadcast node set
    pub nodes: NodesConfig,

    #[serde(default)]
    pub nonce: NonceConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub fetcher: FetcherConfig,

    pub reserve: ReserveSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    pub endpoints: Vec<NodeConfig>,

    /// Per-node deadline for one broadcast
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// How long a trusted nonce survives a node reporting a lower value
    #[serde(default = "default_nonce_expiry_secs")]
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoubleCheckConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Fraction of the backoff randomized (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Age after which a lost transaction is declared failed
    #[serde(default = "default_lost_tx_expiry_secs")]
    pub lost_tx_expiry_secs: u64,

    /// Age after which an exchange activity is forced to failed
    #[serde(default = "default_max_activity_lifetime_secs")]
    pub max_activity_lifetime_secs: u64,

    #[serde(default)]
    pub double_check: DoubleCheckConfig,

    /// Deadline for every status or balance call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_order_book_interval_ms")]
    pub order_book_interval_ms: u64,

    #[serde(default = "default_auth_interval_ms")]
    pub auth_interval_ms: u64,

    #[serde(default = "default_rate_interval_ms")]
    pub rate_interval_ms: u64,

    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,

    #[serde(default = "default_reference_interval_ms")]
    pub reference_interval_ms: u64,

    /// Rates are not fetched while the block height is younger than this
    #[serde(default = "default_rate_block_debounce_ms")]
    pub rate_block_debounce_ms: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSection {
    /// Reserve contract holding the on-chain inventory
    pub address: Address,

    /// Signing identities by name
    pub operators: BTreeMap<String, Address>,

    /// Operator that signs rate updates
    #[serde(default = "default_pricing_operator")]
    pub pricing_operator: String,

    #[serde(default = "default_gas_price_gwei")]
    pub gas_price_gwei: u64,

    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
}

fn default_broadcast_timeout_ms() -> u64 { 2_000 }
fn default_nonce_expiry_secs() -> u64 { 120 }
fn default_max_rounds() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 50 }
fn default_max_backoff_ms() -> u64 { 1_000 }
fn default_jitter_factor() -> f64 { 0.2 }
fn default_lost_tx_expiry_secs() -> u64 { 15 * 60 }
fn default_max_activity_lifetime_secs() -> u64 { 6 * 60 * 60 }
fn default_call_timeout_ms() -> u64 { 7_000 }
fn default_order_book_interval_ms() -> u64 { 7_000 }
fn default_auth_interval_ms() -> u64 { 5_000 }
fn default_rate_interval_ms() -> u64 { 3_000 }
fn default_block_interval_ms() -> u64 { 2_000 }
fn default_reference_interval_ms() -> u64 { 60_000 }
fn default_rate_block_debounce_ms() -> u64 { 5_000 }
fn default_fetch_timeout_ms() -> u64 { 5_000 }
fn default_pricing_operator() -> String { "pricing".to_string() }
fn default_gas_price_gwei() -> u64 { 10 }
fn default_max_gas_price_gwei() -> u64 { 100 }

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_nonce_expiry_secs(),
        }
    }
}

impl Default for DoubleCheckConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lost_tx_expiry_secs: default_lost_tx_expiry_secs(),
            max_activity_lifetime_secs: default_max_activity_lifetime_secs(),
            double_check: DoubleCheckConfig::default(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            order_book_interval_ms: default_order_book_interval_ms(),
            auth_interval_ms: default_auth_interval_ms(),
            rate_interval_ms: default_rate_interval_ms(),
            block_interval_ms: default_block_interval_ms(),
            reference_interval_ms: default_reference_interval_ms(),
            rate_block_debounce_ms: default_rate_block_debounce_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl NonceConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

impl DoubleCheckConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl ReconcileConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl FetcherConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl ReserveSection {
    pub fn gas_price_wei(&self) -> u128 {
        self.gas_price_gwei as u128 * GWEI
    }

    pub fn max_gas_price_wei(&self) -> u128 {
        self.max_gas_price_gwei as u128 * GWEI
    }

    pub fn operator(&self, name: &str) -> Option<Address> {
        self.operators.get(name).copied()
    }
}

impl ReserveConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse TOML: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::IoError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Read, parse and validate in one step
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one broadcast node is required".to_string(),
            ));
        }

        let mut seen_ids = HashSet::new();
        for node in &self.nodes.endpoints {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node id: {}",
                    node.id
                )));
            }
        }

        let timeouts = [
            ("nodes.broadcast_timeout_ms", self.nodes.broadcast_timeout_ms),
            ("reconcile.call_timeout_ms", self.reconcile.call_timeout_ms),
            ("fetcher.fetch_timeout_ms", self.fetcher.fetch_timeout_ms),
            ("fetcher.order_book_interval_ms", self.fetcher.order_book_interval_ms),
            ("fetcher.auth_interval_ms", self.fetcher.auth_interval_ms),
            ("fetcher.rate_interval_ms", self.fetcher.rate_interval_ms),
            ("fetcher.block_interval_ms", self.fetcher.block_interval_ms),
            ("fetcher.reference_interval_ms", self.fetcher.reference_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{} must be > 0", name)));
            }
        }

        let double_check = &self.reconcile.double_check;
        if double_check.max_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile.double_check.max_rounds must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&double_check.jitter_factor) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid jitter_factor {}: must be within 0.0..=1.0",
                double_check.jitter_factor
            )));
        }

        if self.reserve.operator(&self.reserve.pricing_operator).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Pricing operator '{}' is not in the operator table",
                self.reserve.pricing_operator
            )));
        }

        if self.reserve.gas_price_gwei > self.reserve.max_gas_price_gwei {
            return Err(ConfigError::ValidationError(format!(
                "Gas price {} gwei exceeds ceiling {} gwei",
                self.reserve.gas_price_gwei, self.reserve.max_gas_price_gwei
            )));
        }

        Ok(())
    }
}
