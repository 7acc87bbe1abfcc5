//! Spent-ledger reconciliation.
//!
//! A spend recorded locally can turn out to be wrong: the spending transaction may be dropped
//! from the mempool or orphaned by a DAG reorganization. The `Reconciler` periodically asks the
//! node about every spending transaction in the ledger and reverts the spends the node has
//! positively forgotten. Only a definitive "transaction unknown" answer triggers a revert; any
//! other failure leaves the entry for the next pass.

use crate::rpc::ChainClient;
use crate::store::{SpentLedgerEntry, StoreError, Utxo, UtxoStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Time between passes; the first pass runs one period after start
    pub period: Duration,
    /// Confirmations after which a spend is final and its entry is dropped; 0 keeps entries
    /// until the node forgets the transaction
    pub durable_confirmations: u64,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(3 * 60 * 60),
            durable_confirmations: 720,
        }
    }
}

/// Outcome counts of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Spends reverted because the node no longer knows the spending transaction
    pub reverted: usize,
    /// Entries dropped because the spend is buried deep enough
    pub confirmed: usize,
    /// Entries kept because the spend is known but not yet final
    pub retained: usize,
    /// Entries kept because the node or the store could not give an answer
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Reverted,
    Confirmed,
    Retained,
    Failed,
}

pub struct Reconciler<C: ChainClient + ?Sized> {
    client: Arc<C>,
    store: Arc<UtxoStore>,
    options: ReconcileOptions,
}

impl<C: ChainClient + ?Sized> Reconciler<C> {
    pub fn new(client: Arc<C>, store: Arc<UtxoStore>, options: ReconcileOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Run one pass over the whole ledger. Errors are counted, never propagated.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let entries = match self.store.list_spent_ledger() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to list spent ledger: {}", e);
                report.failed += 1;
                return report;
            }
        };

        for entry in entries {
            report.checked += 1;
            match self.reconcile_entry(&entry).await {
                EntryOutcome::Reverted => report.reverted += 1,
                EntryOutcome::Confirmed => report.confirmed += 1,
                EntryOutcome::Retained => report.retained += 1,
                EntryOutcome::Failed => report.failed += 1,
            }
        }

        report
    }

    async fn reconcile_entry(&self, entry: &SpentLedgerEntry) -> EntryOutcome {
        let txid = &entry.spending_txid;
        match self.client.get_transaction(txid).await {
            Ok(tx) => {
                let durable = self.options.durable_confirmations;
                if durable == 0 || tx.confirmations < durable {
                    return EntryOutcome::Retained;
                }
                match self.store.delete_spent_utxo(txid) {
                    Ok(()) => {
                        debug!("Spend {} is final after {} confirmations", txid, tx.confirmations);
                        EntryOutcome::Confirmed
                    }
                    Err(e) => {
                        warn!("Failed to drop settled ledger entry {}: {}", txid, e);
                        EntryOutcome::Failed
                    }
                }
            }
            Err(e) if e.is_transaction_unknown() => match self.revert(entry) {
                Ok(restored) => {
                    info!(
                        "Reverted spend {}: restored {} outputs",
                        txid, restored
                    );
                    EntryOutcome::Reverted
                }
                Err(e) => {
                    warn!("Failed to revert spend {}, keeping ledger entry: {}", txid, e);
                    EntryOutcome::Failed
                }
            },
            Err(e) => {
                debug!("Could not check spend {}: {}", txid, e);
                EntryOutcome::Failed
            }
        }
    }

    /// Write every consumed output back as unspent, then drop the entry. The entry is only
    /// dropped once all writes succeeded, so a partial failure is retried on the next pass.
    ///
    /// An output that has meanwhile been spent by a different transaction keeps that spend.
    fn revert(&self, entry: &SpentLedgerEntry) -> Result<usize, StoreError> {
        let mut restored = 0;
        for utxo in &entry.consumed {
            match self
                .store
                .get_address_utxo(&utxo.address, &utxo.txid, utxo.output_index)
            {
                Ok(current)
                    if !current.is_unspent() && current.spent_by != entry.spending_txid =>
                {
                    debug!(
                        "Output {} now spent by {}, leaving it",
                        current.key(),
                        current.spent_by
                    );
                    continue;
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let unspent = Utxo {
                spent_by: String::new(),
                ..utxo.clone()
            };
            self.store
                .update_address_utxo_mandatory(&unspent.address, &unspent)?;
            self.store.save_utxo(&unspent)?;
            restored += 1;
        }
        self.store.delete_spent_utxo(&entry.spending_txid)?;
        Ok(restored)
    }

    /// Run passes every period until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            "Reconciler started, checking the spent ledger every {:?}",
            self.options.period
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    info!(
                        "Reconciliation pass: {} checked, {} reverted, {} confirmed, {} retained, {} failed",
                        report.checked, report.reverted, report.confirmed, report.retained, report.failed
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}
