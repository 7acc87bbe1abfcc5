//! Chain node integration
//!
//! This module provides the client contract and types for talking to a DAG-ordered UTXO chain
//! node over JSON-RPC. The synchronizer and reconciler only depend on the `ChainClient` trait,
//! so the in-memory implementation can stand in for a live node.

/// JSON-RPC client and the `ChainClient` contract
mod client;
/// Scripted in-memory chain node
mod memory;
/// Type definitions for node data structures
mod types;

#[cfg(test)]
pub use client::MockChainClient;
pub use client::{ChainClient, JsonRpcClient};
pub use memory::InMemoryChain;
pub use types::*;
