use thiserror::Error;

/// Per-node broadcast failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// Transport-level errors (network, connection)
    #[error("Transport error: {message} (node: {node})")]
    Transport { node: String, message: String },

    #[error("Timeout after {timeout_ms}ms (node: {node})")]
    Timeout { node: String, timeout_ms: u64 },

    /// The node answered and refused the transaction
    #[error("Rejected by node {node}: {message}")]
    Rejected { node: String, message: String },
}

impl RpcError {
    pub fn node(&self) -> &str {
        match self {
            RpcError::Transport { node, .. } => node,
            RpcError::Timeout { node, .. } => node,
            RpcError::Rejected { node, .. } => node,
        }
    }

    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport { .. } => true,
            RpcError::Timeout { .. } => true,
            // nonce too low, underpriced and the like
            RpcError::Rejected { .. } => false,
        }
    }
}
