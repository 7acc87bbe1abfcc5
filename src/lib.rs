//! Sync-and-index engine for a DAG-ordered UTXO chain.
//!
//! Blocks are walked by block order, gated by confirmation depth and block colour, and the
//! outputs paying watched addresses are indexed into a key-value store. Spends made through
//! this engine are kept in a ledger and reverted if the node later forgets the spending
//! transaction.

pub mod config;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod utils;
pub mod utxo;
