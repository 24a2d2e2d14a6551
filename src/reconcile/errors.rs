use crate::collaborators::{ChainError, ExchangeError, StorageError};
use crate::nonce_manager::NonceError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    /// Statuses kept moving while the balance was read
    #[error("Statuses of {origin} did not stabilize after {rounds} rounds")]
    Unstable { origin: String, rounds: u32 },

    #[error("{origin} call timed out after {timeout_ms}ms")]
    Timeout { origin: String, timeout_ms: u64 },

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Unstable { .. } => true,
            ReconcileError::Timeout { .. } => true,
            ReconcileError::Chain(e) => e.is_transient(),
            ReconcileError::Exchange(e) => e.is_transient(),
            ReconcileError::Storage(_) => false,
            ReconcileError::Nonce(e) => e.is_transient(),
        }
    }
}
