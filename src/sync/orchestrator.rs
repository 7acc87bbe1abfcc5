//! UTXO sync orchestrator and integration point for all sync services.
//!
//! This module defines the `UtxoSyncOrchestrator`, which owns every component of a running
//! indexer: the store, the synchronizer, the batch indexer consuming its queue, and the
//! reconciler auditing the spent ledger. There are no process-wide singletons; everything a
//! component needs is handed to it here.
//!
//! The orchestrator is responsible for:
//! - Registering the configured watched addresses
//! - Choosing the resume point from the store and starting the synchronizer
//! - Running the indexer and the reconciler as background tasks
//! - Broadcasting transactions and recording the spends they make
//! - Shutting down in order so no accepted batch is lost

use crate::rpc::ChainClient;
use crate::store::{SpentLedgerEntry, Utxo, UtxoSet, UtxoStore};
use crate::sync::{
    indexer::{BatchIndexer, IndexerStats},
    reconcile::{ReconcileOptions, Reconciler},
    synchronizer::{SyncOptions, Synchronizer},
    types::{IndexerFailure, SyncCheckpoint, SyncError},
};
use crate::utils::{COIN_DECIMALS, format_coin_amount};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything the orchestrator needs besides the client and the store
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Block order to start from when the store has no cursor yet
    pub start_order: u64,
    /// Addresses registered as watched on start
    pub addresses: Vec<String>,
    pub sync: SyncOptions,
    pub reconcile: ReconcileOptions,
}

/// Main orchestrator that coordinates all sync components.
pub struct UtxoSyncOrchestrator<C: ChainClient + ?Sized + 'static> {
    client: Arc<C>,
    store: Arc<UtxoStore>,
    synchronizer: Synchronizer<C>,
    options: ServiceOptions,
    indexer_task: Option<JoinHandle<IndexerStats>>,
    indexer_failure: Option<watch::Receiver<Option<IndexerFailure>>>,
    reconciler_task: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    /// Checkpoint the run started from, before the rewind
    started: SyncCheckpoint,
}

impl<C: ChainClient + ?Sized + 'static> UtxoSyncOrchestrator<C> {
    pub fn new(client: Arc<C>, store: Arc<UtxoStore>, options: ServiceOptions) -> Self {
        let synchronizer = Synchronizer::new(client.clone(), options.sync.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            store,
            synchronizer,
            options,
            indexer_task: None,
            indexer_failure: None,
            reconciler_task: None,
            shutdown,
            started: SyncCheckpoint::default(),
        }
    }

    /// Start syncing.
    ///
    /// Resumes from the stored cursor, or from the configured start order on a fresh store.
    ///
    /// # Returns
    /// The checkpoint the synchronizer was started with, before its rewind.
    pub async fn start(&mut self) -> Result<SyncCheckpoint, SyncError> {
        for address in &self.options.addresses {
            self.store.insert_address(address)?;
        }

        let stored_order = self.store.get_cursor()?;
        let start_order = if stored_order != 0 {
            stored_order
        } else {
            self.options.start_order
        };
        let stored_coinbase_order = self.store.get_coinbase_cursor()?;
        let checkpoint = SyncCheckpoint {
            last_tx_block_order: start_order,
            last_coinbase_block_order: if stored_coinbase_order != 0 {
                stored_coinbase_order
            } else {
                start_order
            },
            last_height: self.store.get_height()?,
        };

        let indexer = BatchIndexer::new(self.store.clone())?;
        let receiver = self.synchronizer.start(checkpoint).await?;
        self.started = checkpoint;
        self.indexer_failure = Some(indexer.subscribe_failure());
        if let Some(thresholds) = self.synchronizer.thresholds() {
            self.store.set_coinbase_maturity(thresholds.coinbase);
        }

        self.indexer_task = Some(tokio::spawn(indexer.run(receiver)));

        let reconciler = Reconciler::new(
            self.client.clone(),
            self.store.clone(),
            self.options.reconcile.clone(),
        );
        self.reconciler_task = Some(tokio::spawn(reconciler.run(self.shutdown.subscribe())));

        let addresses = self.store.list_addresses()?;
        info!(
            "UTXO sync started at order {} for {} watched addresses, {} unspent",
            start_order,
            addresses.len(),
            format_coin_amount(self.store.sum_unspent(None)?, COIN_DECIMALS)
        );

        Ok(checkpoint)
    }

    /// Batch the indexer stopped at, if it stopped early.
    pub fn indexer_failure(&self) -> Option<IndexerFailure> {
        self.indexer_failure
            .as_ref()
            .and_then(|failure| failure.borrow().clone())
    }

    /// Resolves once the indexer stops at a batch it could not apply. Never resolves if the
    /// indexer keeps up or was never started.
    pub async fn wait_for_indexer_failure(&self) -> IndexerFailure {
        if let Some(mut failure) = self.indexer_failure.clone() {
            loop {
                if let Some(stopped_at) = failure.borrow_and_update().clone() {
                    return stopped_at;
                }
                if failure.changed().await.is_err() {
                    break;
                }
            }
        }
        std::future::pending().await
    }

    /// Stop every component and persist the final checkpoint.
    ///
    /// The polling loops are stopped first; the indexer then drains whatever they queued
    /// before the cursors are written, so nothing accepted is skipped on the next start.
    /// The synchronizer's checkpoint is only persisted when the indexer applied every batch,
    /// and only where it is ahead of both the stored value and the point this run started
    /// from. A run that made no progress never moves the stored cursors back.
    ///
    /// # Returns
    /// The checkpoint now in the store, or `SyncError::IndexerStopped` if the indexer stopped
    /// early. The store is flushed in both cases.
    pub async fn shutdown(&mut self) -> Result<SyncCheckpoint, SyncError> {
        self.synchronizer.stop();
        for stats in self.synchronizer.wait().await {
            info!("{}", stats.summary());
        }

        let mut outcome = Ok(());
        if let Some(task) = self.indexer_task.take() {
            match task.await {
                Ok(stats) => {
                    info!(
                        "Indexer finished: {} batches applied, {} outputs indexed, {} spent",
                        stats.batches_applied, stats.outputs_indexed, stats.outputs_spent
                    );
                    if let Some(failure) = stats.failure {
                        outcome = Err(SyncError::IndexerStopped(failure));
                    }
                }
                Err(e) => {
                    error!("Indexer task failed: {}", e);
                    outcome = Err(SyncError::IndexerTask(e.to_string()));
                }
            }
        }

        let checkpoint = self.synchronizer.checkpoint();
        if outcome.is_ok() {
            self.persist(checkpoint)?;
        } else {
            warn!(
                "Indexer stopped early, keeping its cursors instead of order {}",
                checkpoint.last_tx_block_order
            );
        }

        self.shutdown.send_replace(true);
        if let Some(task) = self.reconciler_task.take() {
            if let Err(e) = task.await {
                error!("Reconciler task failed: {}", e);
            }
        }

        self.store.flush()?;
        let stored = SyncCheckpoint {
            last_tx_block_order: self.store.get_cursor()?,
            last_coinbase_block_order: self.store.get_coinbase_cursor()?,
            last_height: self.store.get_height()?,
        };
        info!(
            "UTXO sync stopped at order {}",
            stored.last_tx_block_order
        );
        outcome.map(|()| stored)
    }

    fn persist(&self, checkpoint: SyncCheckpoint) -> Result<(), SyncError> {
        let started = self.started;
        if checkpoint.last_tx_block_order
            > self.store.get_cursor()?.max(started.last_tx_block_order)
        {
            self.store.update_cursor(checkpoint.last_tx_block_order)?;
        }
        if checkpoint.last_coinbase_block_order
            > self
                .store
                .get_coinbase_cursor()?
                .max(started.last_coinbase_block_order)
        {
            self.store
                .update_coinbase_cursor(checkpoint.last_coinbase_block_order)?;
        }
        if checkpoint.last_height > self.store.get_height()? {
            self.store.update_height(checkpoint.last_height)?;
        }
        Ok(())
    }

    /// Broadcast a raw transaction and record the outputs it spends.
    ///
    /// # Arguments
    /// * `raw_hex` - Signed transaction, hex encoded.
    /// * `spent` - Indexed outputs the transaction consumes.
    ///
    /// # Returns
    /// The txid reported by the node. The outputs are marked spent by it and a ledger entry is
    /// written, so the reconciler reverts them if the node later drops the transaction.
    pub async fn broadcast(&self, raw_hex: &str, spent: &[Utxo]) -> Result<String, SyncError> {
        let txid = self.synchronizer.send_tx(raw_hex).await?;

        let mut consumed = Vec::with_capacity(spent.len());
        for utxo in spent {
            let marked = Utxo {
                spent_by: txid.clone(),
                ..utxo.clone()
            };
            let merged = self.store.update_address_utxo(&utxo.address, marked)?;
            self.store.save_utxo(&merged)?;
            consumed.push(Utxo {
                spent_by: String::new(),
                ..utxo.clone()
            });
        }

        if !consumed.is_empty() {
            let entry = match self.store.get_spent_utxo(&txid)? {
                Some(mut existing) => {
                    existing.merge(consumed);
                    existing
                }
                None => SpentLedgerEntry::new(txid.clone(), consumed),
            };
            self.store.insert_spent_utxo(&entry)?;
        }

        Ok(txid)
    }

    /// Spendable outputs of `address` at the indexed height.
    pub fn balance(&self, address: &str, coin: Option<&str>) -> Result<UtxoSet, SyncError> {
        let height = self.store.get_height()?;
        Ok(self.store.get_address_utxos(address, coin, height)?)
    }

    pub fn store(&self) -> &Arc<UtxoStore> {
        &self.store
    }

    pub fn synchronizer(&self) -> &Synchronizer<C> {
        &self.synchronizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Block, InMemoryChain, NodeInfo, ScriptPubKey, Transaction, TxInput, TxOutput};
    use crate::store::{Bucket, KeyValueBackend, MemoryBackend};
    use std::time::Duration;

    fn orchestrator(
        chain: Arc<InMemoryChain>,
        store: Arc<UtxoStore>,
    ) -> UtxoSyncOrchestrator<InMemoryChain> {
        UtxoSyncOrchestrator::new(
            chain,
            store,
            ServiceOptions {
                start_order: 40,
                addresses: vec!["TmA".to_string()],
                sync: SyncOptions {
                    retry_delay: Duration::from_millis(10),
                    ..SyncOptions::default()
                },
                reconcile: ReconcileOptions {
                    period: Duration::from_secs(3600),
                    ..ReconcileOptions::default()
                },
            },
        )
    }

    fn node_info() -> NodeInfo {
        NodeInfo {
            confirmations: 10,
            coinbase_maturity: 16,
            ..NodeInfo::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_store_starts_from_configured_order() {
        let chain = Arc::new(InMemoryChain::new(node_info()));
        let store = Arc::new(UtxoStore::in_memory().expect("store"));
        let mut service = orchestrator(chain.clone(), store.clone());

        let checkpoint = service.start().await.expect("start");
        assert_eq!(checkpoint.last_tx_block_order, 40);
        assert!(store.address_exists("TmA").expect("exists"));
        assert_eq!(store.coinbase_maturity(), 16);

        let stopped = service.shutdown().await.expect("shutdown");
        // nothing on chain yet, so the rewound position is not persisted
        assert_eq!(stopped.last_tx_block_order, 0);
        assert_eq!(store.get_cursor().expect("cursor"), 0);

        let mut restarted = orchestrator(chain, store.clone());
        let checkpoint = restarted.start().await.expect("restart");
        assert_eq!(checkpoint.last_tx_block_order, 40);
        restarted.shutdown().await.expect("shutdown");
        assert_eq!(store.get_cursor().expect("cursor"), 0);
    }

    #[tokio::test]
    async fn test_stored_cursor_wins_over_configured_start() {
        let chain = Arc::new(InMemoryChain::new(node_info()));
        let store = Arc::new(UtxoStore::in_memory().expect("store"));
        store.update_cursor(500).expect("cursor");
        let mut service = orchestrator(chain, store.clone());

        let checkpoint = service.start().await.expect("start");
        assert_eq!(checkpoint.last_tx_block_order, 500);
        let stopped = service.shutdown().await.expect("shutdown");
        // the stored cursor never moves back to the rewound position
        assert_eq!(stopped.last_tx_block_order, 500);
        assert_eq!(store.get_cursor().expect("cursor"), 500);
    }

    #[tokio::test]
    async fn test_broadcast_marks_spent_and_records_ledger() {
        let chain = Arc::new(InMemoryChain::new(node_info()));
        let store = Arc::new(UtxoStore::in_memory().expect("store"));
        store.insert_address("TmA").expect("address");
        let funding = Utxo {
            txid: "t1".to_string(),
            address: "TmA".to_string(),
            amount: 100,
            ..Utxo::default()
        };
        store.update_address_utxo("TmA", funding.clone()).expect("utxo");
        let service = orchestrator(chain.clone(), store.clone());

        let txid = service.broadcast("beef", &[funding]).await.expect("broadcast");
        assert_eq!(txid, "beef");
        assert_eq!(chain.broadcast_transactions(), vec!["beef".to_string()]);
        assert_eq!(
            store.get_address_utxo("TmA", "t1", 0).expect("utxo").spent_by,
            "beef"
        );
        assert_eq!(store.get_utxo("t1", 0).expect("global").spent_by, "beef");
        let entry = store.get_spent_utxo("beef").expect("ledger").expect("entry");
        assert!(entry.consumed[0].is_unspent());
        assert_eq!(service.balance("TmA", None).expect("balance").total, 0);
    }

    #[tokio::test]
    async fn test_start_fails_when_node_is_down() {
        let chain = Arc::new(InMemoryChain::new(node_info()));
        chain.set_unreachable(true);
        let store = Arc::new(UtxoStore::in_memory().expect("store"));
        let mut service = orchestrator(chain, store);
        assert!(matches!(
            service.start().await,
            Err(SyncError::ThresholdError(_))
        ));
    }

    #[tokio::test]
    async fn test_indexer_failure_is_reported_and_cursor_kept() {
        let chain = Arc::new(InMemoryChain::new(node_info()));
        for order in 35..40 {
            chain.insert_block(Block {
                hash: format!("h{}", order),
                txs_valid: true,
                confirmations: 50,
                order,
                height: order,
                ..Block::default()
            });
        }
        chain.insert_block(Block {
            hash: "h40".to_string(),
            txs_valid: true,
            confirmations: 50,
            order: 40,
            height: 40,
            transactions: vec![Transaction {
                txid: "p".to_string(),
                vin: vec![TxInput {
                    txid: "bad".to_string(),
                    vout: 0,
                    ..TxInput::default()
                }],
                vout: vec![TxOutput {
                    amount: 77,
                    script_pub_key: ScriptPubKey {
                        script_type: "pubkeyhash".to_string(),
                        addresses: vec!["TmA".to_string()],
                        ..ScriptPubKey::default()
                    },
                    ..TxOutput::default()
                }],
                ..Transaction::default()
            }],
            ..Block::default()
        });

        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(&Bucket::Utxos, b"bad-0", b"not json")
            .expect("corrupt");
        let store = Arc::new(UtxoStore::open(backend).expect("store"));
        let mut service = orchestrator(chain, store.clone());
        service.start().await.expect("start");

        let failure = tokio::time::timeout(Duration::from_secs(5), service.wait_for_indexer_failure())
            .await
            .expect("indexer failure");
        assert_eq!(failure.block_order, 40);
        assert_eq!(service.indexer_failure(), Some(failure));

        assert!(matches!(
            service.shutdown().await,
            Err(SyncError::IndexerStopped(ref stopped)) if stopped.block_order == 40
        ));
        // the next start retries the failed block
        assert_eq!(store.get_cursor().expect("cursor"), 0);
    }
}
