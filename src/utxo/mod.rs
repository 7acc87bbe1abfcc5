//! UTXO extraction
//!
//! Turns a single accepted transaction into the outputs it creates for indexable scripts and
//! the prior outputs it consumes. Both functions are pure: the same transaction always yields
//! the same result, independent of store state.

/// Lock height decoding for `CHECKLOCKTIMEVERIFY` scripts
mod script;

use crate::rpc::{ScriptClass, Transaction};
use tracing::warn;

pub use script::decode_lock_height;

/// An output created by a transaction, ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUtxo {
    pub txid: String,
    pub output_index: u32,
    pub coin: String,
    pub coin_id: u16,
    pub amount: u64,
    pub address: String,
    pub created_height: u64,
    pub is_coinbase: bool,
    /// Height from which the output may be spent; 0 when unlocked.
    pub lock_height: u64,
    pub pub_key_hex: String,
}

/// A prior output consumed by a transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpentReference {
    pub txid: String,
    pub output_index: u32,
}

/// Extract the indexable outputs of `tx`.
///
/// Pay-to-pubkey-hash outputs are attributed to their first address with no lock. Lock-time
/// guarded outputs additionally carry the lock height pushed by their script. Outputs with any
/// other script class, no address, or a lock script that cannot be decoded are not indexable.
pub fn extract_outputs(tx: &Transaction) -> Vec<CandidateUtxo> {
    tx.vout
        .iter()
        .enumerate()
        .filter_map(|(index, out)| {
            let script = &out.script_pub_key;
            let lock_height = match script.class() {
                ScriptClass::PubKeyHash => 0,
                ScriptClass::CltvPubKeyHash => match decode_lock_height(&script.hex) {
                    Some(height) => height,
                    None => {
                        warn!(
                            "Skipping output {}:{} with undecodable lock script {}",
                            tx.txid, index, script.hex
                        );
                        return None;
                    }
                },
                ScriptClass::Other => return None,
            };
            let address = script.addresses.first()?;

            Some(CandidateUtxo {
                txid: tx.txid.clone(),
                output_index: u32::try_from(index).ok()?,
                coin: out.coin.clone(),
                coin_id: out.coin_id,
                amount: out.amount,
                address: address.clone(),
                created_height: tx.block_height,
                is_coinbase: tx.is_coinbase,
                lock_height,
                pub_key_hex: script.hex.clone(),
            })
        })
        .collect()
}

/// Extract the prior outputs consumed by `tx`. Coinbase inputs consume nothing.
pub fn extract_spent(tx: &Transaction) -> Vec<SpentReference> {
    tx.vin
        .iter()
        .filter(|input| !input.is_coinbase())
        .map(|input| SpentReference {
            txid: input.txid.clone(),
            output_index: input.vout,
        })
        .collect()
}
