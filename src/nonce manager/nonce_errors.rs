use crate::collaborators::ChainError;
use crate::types::Address;
use thiserror::Error;

/// Nonce Manager specific errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NonceError {
    /// The node could not be asked for the operator's nonce
    #[error("RPC error: {message} (operator: {operator})")]
    Rpc { operator: Address, message: String },

    /// Timeout waiting for the node
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// No signing identity by that name
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
}

impl NonceError {
    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        match self {
            NonceError::Rpc { .. } => true,
            NonceError::Timeout(_) => true,
            NonceError::UnknownOperator(_) => false,
        }
    }

    pub fn from_chain_error(err: ChainError, operator: Address) -> Self {
        match err {
            ChainError::Timeout(ms) => NonceError::Timeout(ms),
            ChainError::UnknownOperator(name) => NonceError::UnknownOperator(name),
            other => NonceError::Rpc {
                operator,
                message: other.to_string(),
            },
        }
    }
}

pub type NonceResult<T> = Result<T, NonceError>;
