//! Persisted record types and store errors

use crate::utxo::CandidateUtxo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An output owned by a watched address.
///
/// Spent outputs are never deleted; `spent_by` holds the spending txid and is empty while the
/// output is unspent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    #[serde(rename = "vout")]
    pub output_index: u32,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub coin: String,
    #[serde(rename = "coinid", default)]
    pub coin_id: u16,
    #[serde(default)]
    pub amount: u64,
    #[serde(rename = "spent", default)]
    pub spent_by: String,
    #[serde(rename = "height", default)]
    pub created_height: u64,
    #[serde(rename = "lock", default)]
    pub lock_height: u64,
    #[serde(rename = "coinbase", default)]
    pub is_coinbase: bool,
    #[serde(rename = "pubkey", default)]
    pub pub_key_hex: String,
}

impl Utxo {
    /// Store key of this output, `"{txid}-{vout}"`.
    pub fn key(&self) -> String {
        utxo_key(&self.txid, self.output_index)
    }

    pub fn is_unspent(&self) -> bool {
        self.spent_by.is_empty()
    }

    /// Coinbase outputs need `maturity` blocks on top of their creation height.
    pub fn is_mature(&self, current_height: u64, maturity: u64) -> bool {
        !self.is_coinbase || current_height.saturating_sub(self.created_height) >= maturity
    }

    pub fn is_unlocked(&self, current_height: u64) -> bool {
        current_height >= self.lock_height
    }

    /// Unspent, mature and unlocked at `current_height`.
    pub fn is_spendable(&self, current_height: u64, maturity: u64) -> bool {
        self.is_unspent()
            && self.is_mature(current_height, maturity)
            && self.is_unlocked(current_height)
    }

    pub fn matches_coin(&self, coin: Option<&str>) -> bool {
        coin.is_none_or(|coin| self.coin == coin)
    }
}

impl From<CandidateUtxo> for Utxo {
    fn from(candidate: CandidateUtxo) -> Self {
        Self {
            txid: candidate.txid,
            output_index: candidate.output_index,
            address: candidate.address,
            coin: candidate.coin,
            coin_id: candidate.coin_id,
            amount: candidate.amount,
            spent_by: String::new(),
            created_height: candidate.created_height,
            lock_height: candidate.lock_height,
            is_coinbase: candidate.is_coinbase,
            pub_key_hex: candidate.pub_key_hex,
        }
    }
}

pub fn utxo_key(txid: &str, output_index: u32) -> String {
    format!("{}-{}", txid, output_index)
}

/// Outputs consumed by one spending transaction, kept until reconciliation settles the spend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpentLedgerEntry {
    #[serde(rename = "spent_txid")]
    pub spending_txid: String,
    /// Snapshots of the consumed outputs as they were before the spend.
    #[serde(rename = "utxos")]
    pub consumed: Vec<Utxo>,
    pub recorded_at: DateTime<Utc>,
}

impl SpentLedgerEntry {
    pub fn new(spending_txid: impl Into<String>, consumed: Vec<Utxo>) -> Self {
        Self {
            spending_txid: spending_txid.into(),
            consumed,
            recorded_at: Utc::now(),
        }
    }

    /// Add outputs not already present, keyed by `(txid, vout)`.
    pub fn merge(&mut self, other: Vec<Utxo>) {
        for utxo in other {
            if !self.consumed.iter().any(|known| known.key() == utxo.key()) {
                self.consumed.push(utxo);
            }
        }
    }
}

/// A filtered set of outputs and the sum of their amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    pub utxos: Vec<Utxo>,
    pub total: u64,
}

impl FromIterator<Utxo> for UtxoSet {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        let utxos: Vec<Utxo> = iter.into_iter().collect();
        let total = utxos
            .iter()
            .fold(0u64, |acc, utxo| acc.saturating_add(utxo.amount));
        Self { utxos, total }
    }
}

/// Error types for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to decode {key} in {bucket}: {source}")]
    Decode {
        bucket: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt cursor value under {0}")]
    CorruptCursor(String),

    #[error("UTXO {0} not found")]
    NotFound(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(created_height: u64) -> Utxo {
        Utxo {
            txid: "cb".to_string(),
            amount: 50,
            created_height,
            is_coinbase: true,
            ..Utxo::default()
        }
    }

    #[test]
    fn test_coinbase_maturity_boundary() {
        let utxo = coinbase(100);
        assert!(!utxo.is_spendable(100 + 719, 720));
        assert!(utxo.is_spendable(100 + 720, 720));
        // height not yet caught up with the output
        assert!(!utxo.is_spendable(50, 720));
    }

    #[test]
    fn test_lock_height_boundary() {
        let utxo = Utxo {
            lock_height: 500,
            ..Utxo::default()
        };
        assert!(!utxo.is_spendable(499, 720));
        assert!(utxo.is_spendable(500, 720));
    }

    #[test]
    fn test_record_uses_persisted_field_names() {
        let utxo = Utxo {
            txid: "t1".to_string(),
            output_index: 0,
            spent_by: "abc".to_string(),
            ..Utxo::default()
        };
        let json = serde_json::to_value(&utxo).expect("encode");
        assert_eq!(json["vout"], 0);
        assert_eq!(json["spent"], "abc");
        assert_eq!(utxo.key(), "t1-0");
    }

    #[test]
    fn test_ledger_merge_deduplicates() {
        let a = Utxo {
            txid: "t1".to_string(),
            ..Utxo::default()
        };
        let b = Utxo {
            txid: "t1".to_string(),
            output_index: 1,
            ..Utxo::default()
        };
        let mut entry = SpentLedgerEntry::new("abc", vec![a.clone()]);
        entry.merge(vec![a, b]);
        assert_eq!(entry.consumed.len(), 2);
    }
}
