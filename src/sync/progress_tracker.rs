//! Progress tracking for a block polling loop.
//!
//! This module provides the `SyncProgressTracker`, which records the decisions a polling loop
//! takes per block order (accepted, skipped, deferred) and the number of transactions it
//! emitted, and logs progress at regular intervals.

use super::types::StreamKind;
use tracing::info;

/// Orders between two progress log lines.
const LOG_INTERVAL: u64 = 1000;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    stream: StreamKind,
    /// First block order evaluated in this session
    start_order: u64,
    /// Highest block order accepted or skipped
    highest_processed_order: Option<u64>,
    blocks_accepted: usize,
    blocks_skipped: usize,
    /// Deferrals since the last processed block
    consecutive_deferrals: usize,
    total_deferrals: usize,
    transactions_emitted: usize,
    /// Last order at which we logged progress
    last_logged_order: u64,
}

impl SyncProgressTracker {
    /// Create a new progress tracker starting from the given block order.
    pub fn new(stream: StreamKind, start_order: u64) -> Self {
        Self {
            stream,
            start_order,
            highest_processed_order: None,
            blocks_accepted: 0,
            blocks_skipped: 0,
            consecutive_deferrals: 0,
            total_deferrals: 0,
            transactions_emitted: 0,
            last_logged_order: start_order,
        }
    }

    fn record_processed(&mut self, order: u64) {
        self.highest_processed_order = Some(
            self.highest_processed_order
                .map_or(order, |highest| highest.max(order)),
        );
        self.consecutive_deferrals = 0;
    }

    /// Record an accepted block and the number of transactions it emitted
    pub fn record_accept(&mut self, order: u64, transactions: usize) {
        self.record_processed(order);
        self.blocks_accepted += 1;
        self.transactions_emitted += transactions;
    }

    pub fn record_skip(&mut self, order: u64) {
        self.record_processed(order);
        self.blocks_skipped += 1;
    }

    pub fn record_defer(&mut self) {
        self.consecutive_deferrals += 1;
        self.total_deferrals += 1;
    }

    /// Deferrals since the last block was processed; 1 means the loop just reached the tip.
    pub fn consecutive_deferrals(&self) -> usize {
        self.consecutive_deferrals
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&mut self, force: bool) {
        let Some(highest) = self.highest_processed_order else {
            return;
        };
        let orders_since_last_log = highest.saturating_sub(self.last_logged_order);
        if force || orders_since_last_log >= LOG_INTERVAL {
            info!(
                "{:?} sync progress: {} blocks accepted, {} skipped, {} transactions up to order {}",
                self.stream,
                self.blocks_accepted,
                self.blocks_skipped,
                self.transactions_emitted,
                highest
            );
            self.last_logged_order = highest;
        }
    }

    /// Get sync statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            stream: self.stream,
            start_order: self.start_order,
            highest_processed_order: self.highest_processed_order,
            blocks_accepted: self.blocks_accepted,
            blocks_skipped: self.blocks_skipped,
            deferrals: self.total_deferrals,
            transactions_emitted: self.transactions_emitted,
        }
    }
}

/// Statistics about the sync progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub stream: StreamKind,
    pub start_order: u64,
    pub highest_processed_order: Option<u64>,
    pub blocks_accepted: usize,
    pub blocks_skipped: usize,
    pub deferrals: usize,
    pub transactions_emitted: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        match self.highest_processed_order {
            Some(highest) => format!(
                "{:?} sync from order {} to {}: {} accepted, {} skipped, {} deferrals, {} transactions",
                self.stream,
                self.start_order,
                highest,
                self.blocks_accepted,
                self.blocks_skipped,
                self.deferrals,
                self.transactions_emitted
            ),
            None => format!(
                "{:?} sync from order {}: no blocks processed, {} deferrals",
                self.stream, self.start_order, self.deferrals
            ),
        }
    }
}
