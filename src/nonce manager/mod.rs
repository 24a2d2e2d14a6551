//! Nonce Manager Module
//!
//! Off-chain nonce assignment per signing operator, reconciled against
//! what the nodes report.

pub mod nonce_errors;
pub mod nonce_lease;
pub mod nonce_registry;
pub mod nonce_tracker;

pub use nonce_errors::{NonceError, NonceResult};
pub use nonce_lease::NonceLease;
pub use nonce_registry::{NonceRegistry, NonceSource};
pub use nonce_tracker::{NonceState, NonceTracker, NonceTransition};
