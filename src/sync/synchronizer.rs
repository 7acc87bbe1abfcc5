//!
//! Block synchronizer.
//!
//! The `Synchronizer` walks the chain block order by block order, asks the confirmation policy
//! about each block, and pushes the transactions of accepted blocks onto a bounded queue. One
//! polling task runs per stream: the transaction stream always, the coinbase stream when
//! coinbase outputs are tracked separately. A full queue blocks the producer, which is the only
//! backpressure between the chain and the indexer.
//!
//! Stopping is cooperative. `stop()` raises a flag that each loop checks once per iteration;
//! an in-flight RPC call or enqueue is allowed to finish first.

use super::policy::{ConfirmationPolicy, Decision, Thresholds, TxSelection, filter_and_tag};
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use super::types::*;
use crate::rpc::{ChainClient, RpcError, Transaction};
use backoff::backoff::{Backoff, Constant};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for a synchronizer
#[derive(Debug, Clone)]
pub struct SyncOptions {
	/// Capacity of the batch queue
	pub queue_len: usize,
	/// Overrides the node's transaction confirmation threshold when non-zero
	pub confirmations: Option<u64>,
	/// Block orders re-evaluated below the checkpoint on start
	pub rewind_count: u64,
	/// Sleep after a deferred block
	pub retry_delay: Duration,
	/// Run a separate coinbase stream gated by coinbase maturity
	pub track_coinbase: bool,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			queue_len: 100,
			confirmations: None,
			rewind_count: 5,
			retry_delay: Duration::from_secs(30),
			track_coinbase: false,
		}
	}
}

/// Polls a chain node and emits confirmed transactions in block order
pub struct Synchronizer<C: ChainClient + ?Sized + 'static> {
	client: Arc<C>,
	options: SyncOptions,
	state: Arc<watch::Sender<SyncState>>,
	stop: Arc<AtomicBool>,
	stop_notify: Arc<Notify>,
	tx_cursor: Arc<AtomicU64>,
	coinbase_cursor: Arc<AtomicU64>,
	height: Arc<AtomicU64>,
	thresholds: Option<Thresholds>,
	tasks: Vec<JoinHandle<SyncStats>>,
}

impl<C: ChainClient + ?Sized + 'static> Synchronizer<C> {
	pub fn new(client: Arc<C>, options: SyncOptions) -> Self {
		let (state, _) = watch::channel(SyncState::Idle);
		Self {
			client,
			options,
			state: Arc::new(state),
			stop: Arc::new(AtomicBool::new(false)),
			stop_notify: Arc::new(Notify::new()),
			tx_cursor: Arc::new(AtomicU64::new(0)),
			coinbase_cursor: Arc::new(AtomicU64::new(0)),
			height: Arc::new(AtomicU64::new(0)),
			thresholds: None,
			tasks: Vec::new(),
		}
	}

	/// Start polling from `checkpoint`.
	///
	/// Thresholds are resolved from the node first; if that fails nothing is started. Each
	/// stream's cursor is moved back by the configured rewind count (never below zero) so the
	/// last blocks before a restart are evaluated again.
	///
	/// # Returns
	/// The receiving end of the batch queue. It yields `None` once every polling loop has
	/// exited.
	pub async fn start(
		&mut self,
		checkpoint: SyncCheckpoint,
	) -> Result<mpsc::Receiver<TxBatch>, SyncError> {
		if *self.state.borrow() != SyncState::Idle {
			return Err(SyncError::AlreadyStarted);
		}

		let thresholds = Thresholds::resolve(self.client.as_ref(), self.options.confirmations)
			.await
			.map_err(SyncError::ThresholdError)?;
		self.thresholds = Some(thresholds);
		let policy = ConfirmationPolicy::new(thresholds);

		let rewind = self.options.rewind_count;
		let tx_start = checkpoint.last_tx_block_order.saturating_sub(rewind);
		let coinbase_start = checkpoint.last_coinbase_block_order.saturating_sub(rewind);
		self.tx_cursor.store(tx_start, Ordering::SeqCst);
		self.coinbase_cursor
			.store(coinbase_start, Ordering::SeqCst);
		self.height
			.store(checkpoint.last_height, Ordering::SeqCst);

		let (sender, receiver) = mpsc::channel(self.options.queue_len.max(1));

		let tx_selection = if self.options.track_coinbase {
			TxSelection::NonCoinbase
		} else {
			TxSelection::All
		};
		let mut loops = vec![self.polling_loop(
			policy,
			StreamKind::Transactions,
			tx_selection,
			self.tx_cursor.clone(),
			sender.clone(),
		)];
		if self.options.track_coinbase {
			loops.push(self.polling_loop(
				policy,
				StreamKind::Coinbase,
				TxSelection::CoinbaseOnly,
				self.coinbase_cursor.clone(),
				sender.clone(),
			));
		}
		drop(sender);

		info!(
			"Starting synchronizer at order {} (checkpoint {}, rewind {})",
			tx_start, checkpoint.last_tx_block_order, rewind
		);

		let live_loops = Arc::new(AtomicUsize::new(loops.len()));
		self.state.send_replace(SyncState::Running);
		for polling_loop in loops {
			let live_loops = live_loops.clone();
			let state = self.state.clone();
			self.tasks.push(tokio::spawn(async move {
				let stats = polling_loop.run().await;
				if live_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
					state.send_replace(SyncState::Stopped);
				}
				stats
			}));
		}

		Ok(receiver)
	}

	fn polling_loop(
		&self,
		policy: ConfirmationPolicy,
		stream: StreamKind,
		selection: TxSelection,
		cursor: Arc<AtomicU64>,
		sender: mpsc::Sender<TxBatch>,
	) -> PollingLoop<C> {
		PollingLoop {
			client: self.client.clone(),
			policy,
			stream,
			selection,
			tracker: SyncProgressTracker::new(stream, cursor.load(Ordering::SeqCst)),
			cursor,
			height: self.height.clone(),
			sender,
			stop: self.stop.clone(),
			stop_notify: self.stop_notify.clone(),
			backoff: Constant::new(self.options.retry_delay),
			retry_delay: self.options.retry_delay,
		}
	}

	/// Ask every polling loop to exit at its next iteration.
	pub fn stop(&self) {
		self.stop.store(true, Ordering::SeqCst);
		self.stop_notify.notify_waiters();
		if *self.state.borrow() == SyncState::Idle {
			self.state.send_replace(SyncState::Stopped);
		}
		info!("Synchronizer stop requested");
	}

	/// Wait for the polling loops to exit and return their statistics.
	pub async fn wait(&mut self) -> Vec<SyncStats> {
		let mut stats = Vec::new();
		for task in self.tasks.drain(..) {
			match task.await {
				Ok(loop_stats) => stats.push(loop_stats),
				Err(e) => error!("Polling loop task failed: {}", e),
			}
		}
		stats
	}

	pub fn state(&self) -> SyncState {
		*self.state.borrow()
	}

	/// Current cursors. While running this is a best-effort snapshot.
	pub fn checkpoint(&self) -> SyncCheckpoint {
		SyncCheckpoint {
			last_tx_block_order: self.tx_cursor.load(Ordering::SeqCst),
			last_coinbase_block_order: self.coinbase_cursor.load(Ordering::SeqCst),
			last_height: self.height.load(Ordering::SeqCst),
		}
	}

	/// Thresholds resolved at start, if started.
	pub fn thresholds(&self) -> Option<Thresholds> {
		self.thresholds
	}

	/// Broadcast a raw transaction through the node.
	pub async fn send_tx(&self, raw_hex: &str) -> Result<String, RpcError> {
		let txid = self.client.send_transaction(raw_hex).await?;
		info!("Broadcast transaction {}", txid);
		Ok(txid)
	}

	pub async fn get_tx(&self, txid: &str) -> Result<Transaction, RpcError> {
		self.client.get_transaction(txid).await
	}
}

/// Result of evaluating one block order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
	Accepted(usize),
	Skipped,
	Deferred,
	/// The batch queue has no receiver left
	Closed,
}

pub(crate) struct PollingLoop<C: ChainClient + ?Sized> {
	client: Arc<C>,
	policy: ConfirmationPolicy,
	stream: StreamKind,
	selection: TxSelection,
	cursor: Arc<AtomicU64>,
	height: Arc<AtomicU64>,
	sender: mpsc::Sender<TxBatch>,
	stop: Arc<AtomicBool>,
	stop_notify: Arc<Notify>,
	backoff: Constant,
	retry_delay: Duration,
	tracker: SyncProgressTracker,
}

impl<C: ChainClient + ?Sized> PollingLoop<C> {
	/// Evaluate the block at the cursor and act on the decision.
	///
	/// The cursor moves forward by exactly one on ACCEPT or SKIP and stays put otherwise.
	pub(crate) async fn step(&mut self) -> StepOutcome {
		let order = self.cursor.load(Ordering::SeqCst);
		match self
			.policy
			.evaluate(self.client.as_ref(), self.stream, order)
			.await
		{
			Decision::Defer(reason) => {
				self.tracker.record_defer();
				if self.tracker.consecutive_deferrals() == 1 {
					debug!("{:?} order {} deferred: {:?}", self.stream, order, reason);
				}
				StepOutcome::Deferred
			}
			Decision::Skip { hash } => {
				debug!("{:?} order {} skipped (block {})", self.stream, order, hash);
				self.cursor.store(order + 1, Ordering::SeqCst);
				self.tracker.record_skip(order);
				StepOutcome::Skipped
			}
			Decision::Accept {
				block,
				coinbase_usable,
			} => {
				let transactions = filter_and_tag(&block, coinbase_usable, self.selection);
				let emitted = transactions.len();
				if !transactions.is_empty() {
					let batch = TxBatch {
						stream: self.stream,
						block_order: order,
						block_height: block.height,
						block_hash: block.hash.clone(),
						transactions,
					};
					if self.sender.send(batch).await.is_err() {
						return StepOutcome::Closed;
					}
				}
				self.height.fetch_max(block.height, Ordering::SeqCst);
				self.cursor.store(order + 1, Ordering::SeqCst);
				self.tracker.record_accept(order, emitted);
				self.tracker.log_progress(false);
				StepOutcome::Accepted(emitted)
			}
		}
	}

	pub(crate) async fn run(mut self) -> SyncStats {
		info!(
			"{:?} polling loop started at order {}",
			self.stream,
			self.cursor.load(Ordering::SeqCst)
		);

		while !self.stop.load(Ordering::SeqCst) {
			match self.step().await {
				StepOutcome::Deferred => {
					let delay = self.backoff.next_backoff().unwrap_or(self.retry_delay);
					// Register for the wakeup before checking the flag, so a stop raised
					// during the step is never missed.
					let notified = self.stop_notify.notified();
					tokio::pin!(notified);
					notified.as_mut().enable();
					if self.stop.load(Ordering::SeqCst) {
						break;
					}
					tokio::select! {
						_ = tokio::time::sleep(delay) => {}
						_ = notified => {}
					}
				}
				StepOutcome::Closed => {
					warn!("{:?} batch queue closed, stopping polling loop", self.stream);
					break;
				}
				StepOutcome::Accepted(_) | StepOutcome::Skipped => {}
			}
		}

		self.tracker.log_progress(true);
		let stats = self.tracker.get_stats();
		info!("{}", stats.summary());
		stats
	}
}
