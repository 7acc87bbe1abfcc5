//! UTXO Synchronization Module
//!
//! This module provides the core logic for keeping the UTXO store in step with the chain.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The main entry point. It wires the store, synchronizer, indexer and reconciler together.
//! - `policy`: Confirmation and validity rules deciding whether a block is accepted, deferred or skipped.
//! - `synchronizer`: Polling loops walking the chain by block order and feeding a bounded queue.
//! - `indexer`: The queue consumer applying accepted transactions to the store.
//! - `reconcile`: Periodic audit of the spent ledger, reverting spends the node no longer knows.
//! - `progress_tracker`: Counters and periodic progress logging for the polling loops.

/// Queue consumer applying batches to the store
pub mod indexer;
/// Main coordinator for the sync process
pub mod orchestrator;
/// Confirmation and validity policy
pub mod policy;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Spent-ledger reconciliation
pub mod reconcile;
/// Block polling loops
pub mod synchronizer;
/// Shared types and errors
pub mod types;

pub use orchestrator::*;
pub use synchronizer::{SyncOptions, Synchronizer};
pub use types::*;
