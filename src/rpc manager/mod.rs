//! RPC Manager Module
//!
//! Best-effort fan-out of signed transactions to every configured node

use async_trait::async_trait;

pub mod rpc_atomics;
pub mod rpc_broadcaster;
pub mod rpc_errors;

pub use rpc_atomics::{NodeSendStats, FAILING_STREAK};
pub use rpc_broadcaster::{BroadcastOutcome, Broadcaster};
pub use rpc_errors::RpcError;

use crate::collaborators::SignedTx;
use crate::types::TxHash;

/// One node a signed transaction can be submitted to
#[async_trait]
pub trait BroadcastNode: Send + Sync {
    fn id(&self) -> &str;

    async fn send_raw_transaction(&self, tx: &SignedTx) -> Result<TxHash, RpcError>;
}
