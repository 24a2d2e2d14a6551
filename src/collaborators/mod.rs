//! Collaborator interfaces consumed by the core
//!
//! The reconciliation engine and the fetch orchestrator depend only on these
//! traits; concrete backends are selected at construction.

pub mod blockchain;
pub mod exchange;
pub mod reference;
pub mod scheduler;
pub mod storage;

pub use blockchain::{
    AbiValue, Blockchain, ChainError, ContractCall, ContractName, SignedTx, TxLookup, UnsignedTx,
};
pub use exchange::{Exchange, ExchangeBalances, ExchangeError, WithdrawStatus};
pub use reference::{ReferenceError, ReferencePriceSource};
pub use scheduler::{IntervalScheduler, Scheduler, TaskKind, TickReceiver};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use crate::rpc_manager::BroadcastNode;
