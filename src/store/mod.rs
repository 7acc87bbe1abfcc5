//! Persistent UTXO storage
//!
//! The store layers the indexer's record model (outputs per address, a global output index,
//! the spent ledger, cursors and the watched address registry) over an ordered, bucketed
//! key-value backend. `sled` is used on disk; an in-memory backend backs tests.

/// Backend trait, bucket names and the in-memory backend
pub mod backend;
/// Sled-backed backend
mod sled;
/// Record types and errors
mod types;
/// The `UtxoStore` itself
mod utxo_store;

pub use self::sled::SledBackend;
pub use backend::{Bucket, KeyValueBackend, MemoryBackend};
pub use types::*;
pub use utxo_store::{DEFAULT_COINBASE_MATURITY, UtxoStore};
