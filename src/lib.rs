//! Reserve core: fetch-and-reconcile engine
//!
//! Periodically fetches order books, balances, rates and block height from a
//! blockchain and a set of exchanges, reconciles every in-flight activity
//! against both, and persists the results as versioned snapshots.

pub mod collaborators;
pub mod config;
pub mod fetcher;
pub mod logging;
pub mod metrics;
pub mod observability;
pub mod rate_codec;
pub mod rate_setter;
pub mod reconcile;
pub mod types;

#[path = "nonce manager/mod.rs"]
pub mod nonce_manager;

#[path = "rpc manager/mod.rs"]
pub mod rpc_manager;

pub mod test_utils;

#[cfg(test)]
mod tests;

pub use config::ReserveConfig;
pub use fetcher::Fetcher;
pub use rate_setter::{RateSetter, SetRateError};
pub use reconcile::ReconcileEngine;
