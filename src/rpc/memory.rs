//! In-memory chain node used by tests and local dry runs.

use super::client::ChainClient;
use super::types::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ChainState {
    node_info: NodeInfo,
    blocks: BTreeMap<u64, Block>,
    colors: HashMap<String, BlockColor>,
    color_failures: HashMap<String, String>,
    transactions: HashMap<String, Transaction>,
    transaction_failures: HashMap<String, String>,
    unreachable: bool,
    broadcast: Vec<String>,
}

/// Scripted chain node.
///
/// Blocks are addressed by order; blocks past the tip fail like a node that has not seen them
/// yet. Every transaction of an inserted block becomes queryable by txid. Colors default to
/// blue unless set.
#[derive(Debug, Default)]
pub struct InMemoryChain {
    inner: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(node_info: NodeInfo) -> Self {
        Self {
            inner: Mutex::new(ChainState {
                node_info,
                ..ChainState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert_block(&self, block: Block) {
        let mut state = self.state();
        for tx in &block.transactions {
            let mut indexed = tx.clone();
            indexed.block_hash = block.hash.clone();
            indexed.confirmations = block.confirmations;
            state.transactions.insert(tx.txid.clone(), indexed);
        }
        state.blocks.insert(block.order, block);
    }

    pub fn set_confirmations(&self, order: u64, confirmations: u64) {
        let mut state = self.state();
        if let Some(block) = state.blocks.get_mut(&order) {
            block.confirmations = confirmations;
        }
    }

    pub fn set_color(&self, hash: &str, color: BlockColor) {
        let mut state = self.state();
        state.color_failures.remove(hash);
        state.colors.insert(hash.to_string(), color);
    }

    /// Make `isBlue` fail for `hash` until a color is set again.
    pub fn fail_color(&self, hash: &str, message: &str) {
        self.state()
            .color_failures
            .insert(hash.to_string(), message.to_string());
    }

    /// Register a transaction outside any block, e.g. a mempool entry.
    pub fn insert_transaction(&self, tx: Transaction) {
        self.state().transactions.insert(tx.txid.clone(), tx);
    }

    /// Forget a transaction so lookups report it as unknown.
    pub fn remove_transaction(&self, txid: &str) {
        self.state().transactions.remove(txid);
    }

    /// Make lookups of `txid` fail with a non-definitive node error.
    pub fn fail_transaction(&self, txid: &str, message: &str) {
        self.state()
            .transaction_failures
            .insert(txid.to_string(), message.to_string());
    }

    pub fn set_transaction_confirmations(&self, txid: &str, confirmations: u64) {
        if let Some(tx) = self.state().transactions.get_mut(txid) {
            tx.confirmations = confirmations;
        }
    }

    /// Simulate a node that cannot be reached at all.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn broadcast_transactions(&self) -> Vec<String> {
        self.state().broadcast.clone()
    }

    fn check_reachable(state: &ChainState) -> Result<(), RpcError> {
        if state.unreachable {
            return Err(RpcError::UnexpectedResponse(
                "HTTP error: 503 Service Unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn get_block_by_order(&self, order: u64) -> Result<Block, RpcError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        state
            .blocks
            .get(&order)
            .cloned()
            .ok_or_else(|| RpcError::NodeError {
                code: -5,
                message: format!("Block not found: order {}", order),
            })
    }

    async fn get_block_by_id(&self, id: u64) -> Result<Block, RpcError> {
        // Block ids and orders coincide for a linear scripted chain.
        self.get_block_by_order(id).await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        if let Some(message) = state.transaction_failures.get(txid) {
            return Err(RpcError::NodeError {
                code: -32603,
                message: message.clone(),
            });
        }
        state
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| RpcError::TransactionUnknown(txid.to_string()))
    }

    async fn get_node_info(&self) -> Result<NodeInfo, RpcError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        Ok(state.node_info.clone())
    }

    async fn is_blue(&self, hash: &str) -> Result<BlockColor, RpcError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        if let Some(message) = state.color_failures.get(hash) {
            return Err(RpcError::NodeError {
                code: -32603,
                message: message.clone(),
            });
        }
        Ok(state.colors.get(hash).copied().unwrap_or(BlockColor::Blue))
    }

    async fn send_transaction(&self, raw_hex: &str) -> Result<String, RpcError> {
        let mut state = self.state();
        Self::check_reachable(&state)?;
        let raw = raw_hex.trim().to_string();
        if raw.is_empty() {
            return Err(RpcError::NodeError {
                code: -22,
                message: "TX decode failed".to_string(),
            });
        }
        // Scripted txid: the raw payload itself, so tests can predict it.
        let txid = raw.clone();
        state.broadcast.push(raw);
        state.transactions.insert(
            txid.clone(),
            Transaction {
                txid: txid.clone(),
                ..Transaction::default()
            },
        );
        Ok(txid)
    }
}
