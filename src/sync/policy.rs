//! Confirmation and validity policy.
//!
//! Decides, for one block order, whether the block can be trusted yet (ACCEPT), must be
//! retried later (DEFER), or is permanently of no interest (SKIP); and which of an accepted
//! block's transactions are emitted.

use super::types::StreamKind;
use crate::rpc::{Block, BlockColor, ChainClient, RpcError, Transaction};
use tracing::{debug, info};

pub const DEFAULT_COINBASE_THRESHOLD: u64 = 720;
pub const DEFAULT_TRANSACTION_THRESHOLD: u64 = 10;

/// Confirmation depths a block must exceed before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub coinbase: u64,
    pub transaction: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            coinbase: DEFAULT_COINBASE_THRESHOLD,
            transaction: DEFAULT_TRANSACTION_THRESHOLD,
        }
    }
}

impl Thresholds {
    /// Read the thresholds from the node. A non-zero `confirmations` overrides the node's
    /// transaction threshold.
    pub async fn resolve<C: ChainClient + ?Sized>(
        client: &C,
        confirmations: Option<u64>,
    ) -> Result<Self, RpcError> {
        let info = client.get_node_info().await?;
        let thresholds = Self {
            coinbase: info.coinbase_maturity,
            transaction: confirmations
                .filter(|count| *count != 0)
                .unwrap_or(info.confirmations),
        };
        info!(
            "Resolved thresholds: transaction {} confirmations, coinbase {}",
            thresholds.transaction, thresholds.coinbase
        );
        Ok(thresholds)
    }

    pub fn for_stream(&self, stream: StreamKind) -> u64 {
        match stream {
            StreamKind::Transactions => self.transaction,
            StreamKind::Coinbase => self.coinbase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    FetchFailed(String),
    Unconfirmed { confirmations: u64, required: u64 },
    ColorUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The block is deep enough; coinbase outputs may only be used from blue blocks.
    Accept { block: Block, coinbase_usable: bool },
    /// Evaluate the same order again later.
    Defer(DeferReason),
    /// The block's transactions are invalid; move on.
    Skip { hash: String },
}

/// Which transactions of an accepted block a stream emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSelection {
    All,
    NonCoinbase,
    CoinbaseOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy {
    thresholds: Thresholds,
}

impl ConfirmationPolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Evaluate the block at `order` for `stream`.
    ///
    /// RPC failures never escape: a failed fetch or color query means DEFER.
    pub async fn evaluate<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        stream: StreamKind,
        order: u64,
    ) -> Decision {
        let block = match client.get_block_by_order(order).await {
            Ok(block) => block,
            Err(e) => return Decision::Defer(DeferReason::FetchFailed(e.to_string())),
        };

        let required = self.thresholds.for_stream(stream);
        if block.confirmations <= required {
            return Decision::Defer(DeferReason::Unconfirmed {
                confirmations: block.confirmations,
                required,
            });
        }

        if !block.txs_valid {
            debug!("Skipping block {} at order {}: transactions invalid", block.hash, order);
            return Decision::Skip { hash: block.hash };
        }

        match client.is_blue(&block.hash).await {
            Ok(color) => Decision::Accept {
                coinbase_usable: color == BlockColor::Blue,
                block,
            },
            Err(e) => Decision::Defer(DeferReason::ColorUnavailable(e.to_string())),
        }
    }
}

/// Filter and tag the transactions of an accepted block.
///
/// Duplicates are always dropped. Coinbase transactions are dropped unless `coinbase_usable`.
/// Surviving transactions are stamped with the block's order and height.
pub fn filter_and_tag(block: &Block, coinbase_usable: bool, selection: TxSelection) -> Vec<Transaction> {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.duplicate)
        .filter_map(|tx| {
            let is_coinbase = tx.has_coinbase_input();
            let selected = match selection {
                TxSelection::All => !is_coinbase || coinbase_usable,
                TxSelection::NonCoinbase => !is_coinbase,
                TxSelection::CoinbaseOnly => is_coinbase && coinbase_usable,
            };
            selected.then(|| Transaction {
                block_order: block.order,
                block_height: block.height,
                is_coinbase,
                ..tx.clone()
            })
        })
        .collect()
}
