//! Activity reconciliation
//!
//! Each cycle takes the pending activities, learns their chain and exchange
//! status through the double-check protocol, folds the result into the
//! records and writes a new `AuthDataSnapshot`.

pub mod double_check;
pub mod engine;
pub mod errors;
pub mod exchange_status;
pub mod merge;
pub mod mining;
pub mod sources;

pub use double_check::{double_check, Checked, DoubleCheckPolicy, StatusMap, StatusSource};
pub use engine::{substitute_balance, ReconcileEngine};
pub use errors::ReconcileError;
pub use exchange_status::ExchangeResolver;
pub use merge::merge;
pub use mining::{classify, MiningResolution, MiningResolver};
pub use sources::{ChainSource, ExchangeSource};
