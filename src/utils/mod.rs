//!
//! Utility module for the UTXO sync daemon.
//!
//! Re-exports formatting helpers used in log output and the CLI.
/// Utility functions for formatting and display
pub mod index;

pub use index::{COIN_DECIMALS, format_coin_amount};
