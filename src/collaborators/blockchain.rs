//! Blockchain RPC collaborator

use crate::types::{Address, TokenRate, TxHash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Raw lookup of a transaction by hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLookup {
    /// The node has no record of the transaction
    NotFound,
    /// Known to the node, not yet in a block
    Pending,
    /// Included in `block`. `receipt_status` is `None` on chains whose
    /// receipts predate the status field.
    Confirmed {
        block: u64,
        receipt_status: Option<bool>,
    },
}

/// Contracts the core talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractName {
    ConversionRates,
    Reserve,
}

/// ABI-style argument or return value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbiValue {
    Address(Address),
    Uint(u128),
    AddressArray(Vec<Address>),
    UintArray(Vec<u128>),
    Bytes14Array(Vec<[u8; 14]>),
}

impl AbiValue {
    pub fn as_uint(&self) -> Option<u128> {
        match self {
            AbiValue::Uint(v) => Some(*v),
            _ => None,
        }
    }
}

/// A method invocation against a named contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract: ContractName,
    pub method: String,
    pub args: Vec<AbiValue>,
}

impl ContractCall {
    pub fn new(contract: ContractName, method: &str, args: Vec<AbiValue>) -> Self {
        Self {
            contract,
            method: method.to_string(),
            args,
        }
    }
}

/// Transaction built by the collaborator, not yet signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub call: ContractCall,
    pub nonce: u64,
    pub gas_price: u128,
    pub data: Vec<u8>,
}

/// Signed, RLP-ready transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: TxHash,
    pub nonce: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("RPC error: {message} (node: {node:?})")]
    Rpc {
        node: Option<String>,
        message: String,
    },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

impl ChainError {
    pub fn rpc(message: impl Into<String>) -> Self {
        ChainError::Rpc {
            node: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Rpc { .. } => true,
            ChainError::Timeout(_) => true,
            ChainError::Decode(_) => false,
            ChainError::UnknownOperator(_) => false,
            ChainError::Rejected(_) => false,
        }
    }
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn current_block(&self) -> Result<u64, ChainError>;

    async fn transaction_status(&self, hash: TxHash) -> Result<TxLookup, ChainError>;

    /// Raw token balances of `address` keyed by asset symbol
    async fn fetch_balances(
        &self,
        address: Address,
        at_block: u64,
    ) -> Result<BTreeMap<String, u128>, ChainError>;

    async fn fetch_rates(&self, at_block: u64) -> Result<BTreeMap<Address, TokenRate>, ChainError>;

    /// Number of transactions from `operator` already mined
    async fn mined_nonce(&self, operator: Address) -> Result<u64, ChainError>;

    /// Next nonce as seen by the node, pending pool included
    async fn pending_nonce(&self, operator: Address) -> Result<u64, ChainError>;

    async fn call(&self, call: &ContractCall) -> Result<Vec<AbiValue>, ChainError>;

    async fn build_transaction(
        &self,
        call: &ContractCall,
        nonce: u64,
        gas_price: u128,
    ) -> Result<UnsignedTx, ChainError>;

    async fn sign(&self, tx: UnsignedTx, operator: Address) -> Result<SignedTx, ChainError>;
}
