//! Types shared by the synchronizer, indexer and reconciler

use crate::rpc::{RpcError, Transaction};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};

/// Which block stream a batch or cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Regular transactions, gated by the transaction confirmation threshold.
    Transactions,
    /// Coinbase transactions, gated by the coinbase maturity threshold.
    Coinbase,
}

/// Next block orders to evaluate for each stream, plus the highest height indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_tx_block_order: u64,
    pub last_coinbase_block_order: u64,
    pub last_height: u64,
}

/// Transactions of one accepted block, already filtered and tagged.
#[derive(Debug, Clone)]
pub struct TxBatch {
    pub stream: StreamKind,
    pub block_order: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub transactions: Vec<Transaction>,
}

/// A batch the indexer could not apply. The indexer stops consuming at this batch and leaves
/// the stored cursors below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerFailure {
    pub stream: StreamKind,
    pub block_order: u64,
    pub reason: String,
}

/// Lifecycle of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Stopped,
}

/// Error types for synchronization
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Failed to resolve confirmation thresholds: {0}")]
    ThresholdError(#[source] RpcError),

    #[error("Synchronizer already started")]
    AlreadyStarted,

    #[error("Indexer stopped at block order {}: {}", .0.block_order, .0.reason)]
    IndexerStopped(IndexerFailure),

    #[error("Indexer task failed: {0}")]
    IndexerTask(String),
}
