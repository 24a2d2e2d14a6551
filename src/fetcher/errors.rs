use crate::collaborators::{ChainError, ExchangeError, StorageError};
use crate::reconcile::ReconcileError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("{origin} timed out after {timeout_ms}ms")]
    Timeout { origin: String, timeout_ms: u64 },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Chain(e) => e.is_transient(),
            FetchError::Exchange(e) => e.is_transient(),
            FetchError::Storage(_) => false,
            FetchError::Reconcile(e) => e.is_transient(),
            FetchError::Timeout { .. } => true,
        }
    }
}
