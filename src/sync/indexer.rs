//! Batch indexer.
//!
//! Drains the synchronizer's queue and applies each transaction to the store: outputs paying
//! watched addresses are merge-written, outputs consumed by the transaction are marked spent
//! and recorded in the spent ledger, and the stored height and cursors move forward.
//!
//! Every write is a merge-write, so applying a batch twice (after a retry or a restart rewind)
//! leaves the store as if it had been applied once. A batch that fails part-way is therefore
//! safe to apply again, as long as the cursor was not moved past it.

use super::types::{IndexerFailure, StreamKind, TxBatch};
use crate::rpc::Transaction;
use crate::store::{SpentLedgerEntry, StoreError, Utxo, UtxoStore};
use crate::utxo::{extract_outputs, extract_spent};
use backoff::ExponentialBackoff;
use backoff::future::retry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Effect of applying one transaction or batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
	pub outputs_indexed: usize,
	pub outputs_spent: usize,
	pub ledger_entries: usize,
}

impl IndexReport {
	fn add(&mut self, other: &IndexReport) {
		self.outputs_indexed += other.outputs_indexed;
		self.outputs_spent += other.outputs_spent;
		self.ledger_entries += other.ledger_entries;
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexerStats {
	pub batches_applied: usize,
	/// Set when the indexer stopped at a batch it could not apply
	pub failure: Option<IndexerFailure>,
	pub transactions: usize,
	pub outputs_indexed: usize,
	pub outputs_spent: usize,
}

pub struct BatchIndexer {
	store: Arc<UtxoStore>,
	/// Highest values written so far; the store only ever moves forward.
	tx_cursor: AtomicU64,
	coinbase_cursor: AtomicU64,
	height: AtomicU64,
	/// How long a failing batch is retried before the indexer gives up
	retry_window: Duration,
	failure: watch::Sender<Option<IndexerFailure>>,
}

impl BatchIndexer {
	pub fn new(store: Arc<UtxoStore>) -> Result<Self, StoreError> {
		Ok(Self {
			tx_cursor: AtomicU64::new(store.get_cursor()?),
			coinbase_cursor: AtomicU64::new(store.get_coinbase_cursor()?),
			height: AtomicU64::new(store.get_height()?),
			store,
			retry_window: Duration::from_secs(300),
			failure: watch::channel(None).0,
		})
	}

	pub fn with_retry_window(mut self, retry_window: Duration) -> Self {
		self.retry_window = retry_window;
		self
	}

	/// Receives the batch the indexer stopped at, if it ever stops early.
	pub fn subscribe_failure(&self) -> watch::Receiver<Option<IndexerFailure>> {
		self.failure.subscribe()
	}

	/// Apply a single transaction.
	pub fn apply_transaction(&self, tx: &Transaction) -> Result<IndexReport, StoreError> {
		let mut report = IndexReport::default();

		for candidate in extract_outputs(tx) {
			if !self.store.address_exists(&candidate.address)? {
				continue;
			}
			let address = candidate.address.clone();
			let merged = self.store.update_address_utxo(&address, Utxo::from(candidate))?;
			self.store.save_utxo(&merged)?;
			report.outputs_indexed += 1;
		}

		let mut consumed = Vec::new();
		for reference in extract_spent(tx) {
			let utxo = match self.store.get_utxo(&reference.txid, reference.output_index) {
				Ok(utxo) => utxo,
				// Not one of ours.
				Err(StoreError::NotFound(_)) => continue,
				Err(e) => return Err(e),
			};

			let snapshot = Utxo {
				spent_by: String::new(),
				..utxo.clone()
			};
			let spent = Utxo {
				spent_by: tx.txid.clone(),
				..utxo
			};
			let address = spent.address.clone();
			let merged = self.store.update_address_utxo(&address, spent)?;
			self.store.save_utxo(&merged)?;
			consumed.push(snapshot);
		}

		if !consumed.is_empty() {
			report.outputs_spent = consumed.len();
			let entry = match self.store.get_spent_utxo(&tx.txid)? {
				Some(mut existing) => {
					existing.merge(consumed);
					existing
				}
				None => SpentLedgerEntry::new(tx.txid.clone(), consumed),
			};
			self.store.insert_spent_utxo(&entry)?;
			report.ledger_entries = 1;
			debug!(
				"Transaction {} spent {} indexed outputs",
				tx.txid, report.outputs_spent
			);
		}

		Ok(report)
	}

	/// Apply every transaction of `batch` in order, then move the height and the batch's
	/// stream cursor forward.
	pub fn apply_batch(&self, batch: &TxBatch) -> Result<IndexReport, StoreError> {
		let mut report = IndexReport::default();
		for tx in &batch.transactions {
			report.add(&self.apply_transaction(tx)?);
		}

		let height = batch
			.transactions
			.iter()
			.map(|tx| tx.block_height)
			.max()
			.unwrap_or(batch.block_height);
		self.advance(&self.height, height, UtxoStore::update_height)?;

		let next_order = batch.block_order + 1;
		match batch.stream {
			StreamKind::Transactions => {
				self.advance(&self.tx_cursor, next_order, UtxoStore::update_cursor)?
			}
			StreamKind::Coinbase => self.advance(
				&self.coinbase_cursor,
				next_order,
				UtxoStore::update_coinbase_cursor,
			)?,
		}

		Ok(report)
	}

	fn advance(
		&self,
		current: &AtomicU64,
		value: u64,
		write: fn(&UtxoStore, u64) -> Result<(), StoreError>,
	) -> Result<(), StoreError> {
		if value > current.load(Ordering::SeqCst) {
			write(self.store.as_ref(), value)?;
			current.fetch_max(value, Ordering::SeqCst);
		}
		Ok(())
	}

	/// Drain `receiver` until every sender is gone.
	///
	/// A batch whose store writes keep failing is retried with exponential backoff for the
	/// retry window. Decode failures are not retried. If a batch still cannot be applied the
	/// indexer stops there without advancing its cursor, and closes the queue so the polling
	/// loops stop as well.
	pub async fn run(self, mut receiver: mpsc::Receiver<TxBatch>) -> IndexerStats {
		let mut stats = IndexerStats::default();

		while let Some(batch) = receiver.recv().await {
			let indexer = &self;
			let current = &batch;
			let policy = ExponentialBackoff {
				max_elapsed_time: Some(self.retry_window),
				..ExponentialBackoff::default()
			};
			let result = retry(policy, || async move {
				indexer.apply_batch(current).map_err(|e| {
					warn!("Applying block order {} failed: {}", current.block_order, e);
					if e.is_transient() {
						backoff::Error::transient(e)
					} else {
						backoff::Error::permanent(e)
					}
				})
			})
			.await;

			match result {
				Ok(report) => {
					stats.batches_applied += 1;
					stats.transactions += batch.transactions.len();
					stats.outputs_indexed += report.outputs_indexed;
					stats.outputs_spent += report.outputs_spent;
					if report.outputs_indexed > 0 || report.outputs_spent > 0 {
						info!(
							"Indexed block order {}: {} new outputs, {} spent",
							batch.block_order, report.outputs_indexed, report.outputs_spent
						);
					}
				}
				Err(e) => {
					error!(
						"Stopping indexer at {:?} block order {} after store failure: {}",
						batch.stream, batch.block_order, e
					);
					let failure = IndexerFailure {
						stream: batch.stream,
						block_order: batch.block_order,
						reason: e.to_string(),
					};
					self.failure.send_replace(Some(failure.clone()));
					stats.failure = Some(failure);
					break;
				}
			}
		}
		receiver.close();

		info!(
			"Indexer finished: {} batches, {} transactions",
			stats.batches_applied, stats.transactions
		);
		stats
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::{ScriptPubKey, TxInput, TxOutput};
	use crate::store::backend::FlakyBackend;
	use crate::store::{Bucket, KeyValueBackend, MemoryBackend};

	fn pay(address: &str, amount: u64) -> TxOutput {
		TxOutput {
			coin: "MEER".to_string(),
			amount,
			script_pub_key: ScriptPubKey {
				hex: "76a914aa88ac".to_string(),
				script_type: "pubkeyhash".to_string(),
				addresses: vec![address.to_string()],
				..ScriptPubKey::default()
			},
			..TxOutput::default()
		}
	}

	fn spend(txid: &str, vout: u32) -> TxInput {
		TxInput {
			txid: txid.to_string(),
			vout,
			..TxInput::default()
		}
	}

	fn tx(txid: &str, vin: Vec<TxInput>, vout: Vec<TxOutput>, height: u64) -> Transaction {
		Transaction {
			txid: txid.to_string(),
			vin,
			vout,
			block_height: height,
			..Transaction::default()
		}
	}

	fn batch(order: u64, transactions: Vec<Transaction>) -> TxBatch {
		TxBatch {
			stream: StreamKind::Transactions,
			block_order: order,
			block_height: order,
			block_hash: format!("h{}", order),
			transactions,
		}
	}

	fn indexer() -> (BatchIndexer, Arc<UtxoStore>) {
		let store = Arc::new(UtxoStore::in_memory().expect("store"));
		store.insert_address("TmA").expect("address");
		(BatchIndexer::new(store.clone()).expect("indexer"), store)
	}

	#[test]
	fn test_outputs_only_indexed_for_watched_addresses() {
		let (indexer, store) = indexer();
		let report = indexer
			.apply_transaction(&tx("t1", vec![spend("ext", 0)], vec![pay("TmA", 100), pay("TmX", 5)], 10))
			.expect("apply");
		assert_eq!(report.outputs_indexed, 1);
		assert_eq!(report.outputs_spent, 0);
		assert_eq!(store.get_utxo("t1", 0).expect("global").amount, 100);
		assert!(store.get_utxo("t1", 1).is_err());
		assert!(store.list_spent_ledger().expect("ledger").is_empty());
	}

	#[test]
	fn test_spend_marks_outputs_and_records_ledger() {
		let (indexer, store) = indexer();
		indexer
			.apply_batch(&batch(5, vec![tx("t1", vec![spend("ext", 0)], vec![pay("TmA", 100)], 5)]))
			.expect("fund");
		// withdrawal to an external address, no change back
		let report = indexer
			.apply_batch(&batch(6, vec![tx("abc", vec![spend("t1", 0)], vec![pay("TmX", 90)], 6)]))
			.expect("spend");
		assert_eq!(report.outputs_spent, 1);

		let stored = store.get_address_utxo("TmA", "t1", 0).expect("utxo");
		assert_eq!(stored.spent_by, "abc");
		assert_eq!(store.get_utxo("t1", 0).expect("global").spent_by, "abc");

		let entry = store.get_spent_utxo("abc").expect("ledger").expect("entry");
		assert_eq!(entry.consumed.len(), 1);
		assert!(entry.consumed[0].spent_by.is_empty());

		assert_eq!(store.get_cursor().expect("cursor"), 7);
		assert_eq!(store.get_height().expect("height"), 6);
	}

	#[test]
	fn test_replay_is_idempotent_and_never_resurrects() {
		let (indexer, store) = indexer();
		let funding = batch(5, vec![tx("t1", vec![spend("ext", 0)], vec![pay("TmA", 100)], 5)]);
		let spending = batch(6, vec![tx("abc", vec![spend("t1", 0)], vec![pay("TmA", 60)], 6)]);

		indexer.apply_batch(&funding).expect("fund");
		indexer.apply_batch(&spending).expect("spend");
		// restart rewind replays both blocks
		indexer.apply_batch(&funding).expect("replay fund");
		indexer.apply_batch(&spending).expect("replay spend");

		let set = store.get_address_utxos("TmA", None, 100).expect("utxos");
		assert_eq!(set.total, 60);
		assert_eq!(set.utxos.len(), 1);
		assert_eq!(store.get_spent_utxo("abc").expect("ledger").expect("entry").consumed.len(), 1);
		assert_eq!(store.get_cursor().expect("cursor"), 7);
	}

	#[test]
	fn test_cursor_and_height_never_move_back() {
		let (indexer, store) = indexer();
		indexer.apply_batch(&batch(20, vec![tx("t1", vec![], vec![], 20)])).expect("apply");
		indexer.apply_batch(&batch(15, vec![tx("t2", vec![], vec![], 15)])).expect("apply");
		assert_eq!(store.get_cursor().expect("cursor"), 21);
		assert_eq!(store.get_height().expect("height"), 20);

		let mut coinbase = batch(3, vec![]);
		coinbase.stream = StreamKind::Coinbase;
		indexer.apply_batch(&coinbase).expect("apply");
		assert_eq!(store.get_coinbase_cursor().expect("cursor"), 4);
		assert_eq!(store.get_cursor().expect("cursor"), 21);
	}

	#[tokio::test]
	async fn test_run_drains_until_senders_close() {
		let (indexer, store) = indexer();
		let (sender, receiver) = mpsc::channel(2);
		let handle = tokio::spawn(indexer.run(receiver));

		sender
			.send(batch(1, vec![tx("t1", vec![spend("ext", 0)], vec![pay("TmA", 100)], 1)]))
			.await
			.expect("send");
		sender.send(batch(2, vec![])).await.expect("send");
		drop(sender);

		let stats = handle.await.expect("join");
		assert_eq!(stats.batches_applied, 2);
		assert_eq!(stats.outputs_indexed, 1);
		assert_eq!(store.get_cursor().expect("cursor"), 3);
	}

	#[tokio::test]
	async fn test_failed_batch_stops_consumer_without_moving_cursor() {
		let backend = Arc::new(MemoryBackend::new());
		let store = Arc::new(UtxoStore::open(backend.clone()).expect("store"));
		store.insert_address("TmA").expect("address");
		backend.put(&Bucket::Utxos, b"bad-0", b"not json").expect("corrupt");

		let indexer = BatchIndexer::new(store.clone()).expect("indexer");
		let mut failures = indexer.subscribe_failure();
		let paying = batch(1, vec![tx("p", vec![spend("bad", 0)], vec![pay("TmA", 77)], 1)]);
		let (sender, receiver) = mpsc::channel(4);
		sender.send(paying.clone()).await.expect("send");
		sender
			.send(batch(2, vec![tx("q", vec![spend("ext", 0)], vec![pay("TmA", 5)], 2)]))
			.await
			.expect("send");

		let stats = indexer.run(receiver).await;
		let failure = stats.failure.clone().expect("failure");
		assert_eq!(failure.block_order, 1);
		assert_eq!(failure.stream, StreamKind::Transactions);
		assert_eq!(stats.batches_applied, 0);
		assert_eq!(failures.borrow_and_update().as_ref(), Some(&failure));

		// nothing at or after the failed block is acknowledged
		assert_eq!(store.get_cursor().expect("cursor"), 0);
		assert!(store.get_address_utxo("TmA", "q", 0).is_err());
		assert!(sender.send(batch(3, vec![])).await.is_err());

		// once the record is repaired the same block applies in full
		backend.delete(&Bucket::Utxos, b"bad-0").expect("repair");
		let indexer = BatchIndexer::new(store.clone()).expect("indexer");
		indexer.apply_batch(&paying).expect("apply");
		assert_eq!(store.get_address_utxo("TmA", "p", 0).expect("utxo").amount, 77);
		assert_eq!(store.get_cursor().expect("cursor"), 2);
	}

	#[tokio::test]
	async fn test_transient_write_failures_are_retried() {
		let backend = Arc::new(FlakyBackend::new());
		let store = Arc::new(UtxoStore::open(backend.clone()).expect("store"));
		store.insert_address("TmA").expect("address");
		let indexer = BatchIndexer::new(store.clone())
			.expect("indexer")
			.with_retry_window(Duration::from_secs(10));

		backend.fail_next_puts(2);
		let (sender, receiver) = mpsc::channel(1);
		sender
			.send(batch(4, vec![tx("t1", vec![spend("ext", 0)], vec![pay("TmA", 100)], 4)]))
			.await
			.expect("send");
		drop(sender);

		let stats = indexer.run(receiver).await;
		assert_eq!(stats.failure, None);
		assert_eq!(stats.batches_applied, 1);
		assert_eq!(store.get_address_utxo("TmA", "t1", 0).expect("utxo").amount, 100);
		assert_eq!(store.get_cursor().expect("cursor"), 5);
	}
}
