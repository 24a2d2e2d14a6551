use crate::collaborators::ChainError;
use crate::types::Address;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    /// The token was never assigned a slot; packing without it would leave
    /// a stale rate on-chain
    #[error("Token {0} has no slot in the compact-data index table")]
    MissingTokenIndex(Address),

    #[error("Slot {index_in_bulk} out of range for token {token} (max {max})")]
    SlotOutOfRange {
        token: Address,
        index_in_bulk: usize,
        max: usize,
    },

    #[error("Token {0} appears more than once in the rate batch")]
    DuplicateToken(Address),

    #[error("Malformed getCompactData response for token {token}: {reason}")]
    MalformedIndex { token: Address, reason: String },

    #[error("Chain error while loading token slots: {0}")]
    Chain(#[from] ChainError),
}

impl CodecError {
    /// Codec failures are configuration problems; only the chain read that
    /// feeds the slot table can heal by itself
    pub fn is_transient(&self) -> bool {
        match self {
            CodecError::Chain(e) => e.is_transient(),
            _ => false,
        }
    }
}
