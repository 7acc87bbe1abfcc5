//! Types for the chain node JSON-RPC surface

use serde::{Deserialize, Serialize};

/// Substring the node puts in its error message when it has no record of a transaction.
pub const TX_UNKNOWN_MARKER: &str = "No information available about transaction";

/// A block as returned by `getBlockByOrder` / `getBlockByID` with full transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub hash: String,
    /// Whether the transactions carried by this block are valid in the current DAG view.
    #[serde(rename = "txsvalid", default)]
    pub txs_valid: bool,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(rename = "parents", default)]
    pub parent_hashes: Vec<String>,
}

/// A transaction as returned by the node in verbose mode.
///
/// `block_order`, `block_height` and `is_coinbase` are never sent by the node. They are
/// stamped locally once the containing block has been accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub locktime: u64,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    #[serde(rename = "blockhash", default)]
    pub block_hash: String,
    /// Set by the node when the same transaction was already included by another block.
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(skip)]
    pub block_order: u64,
    #[serde(skip)]
    pub block_height: u64,
    #[serde(skip)]
    pub is_coinbase: bool,
}

impl Transaction {
    /// A transaction is a coinbase when its first input carries the coinbase marker.
    pub fn has_coinbase_input(&self) -> bool {
        self.vin
            .first()
            .is_some_and(|input| !input.coinbase.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    /// Coinbase payload; empty for regular inputs.
    #[serde(default)]
    pub coinbase: String,
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub sequence: u64,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        !self.coinbase.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    #[serde(default)]
    pub coin: String,
    #[serde(rename = "coinid", default)]
    pub coin_id: u16,
    #[serde(default)]
    pub amount: u64,
    #[serde(rename = "scriptPubKey", alias = "scriptpubkey", default)]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "reqSigs", default)]
    pub req_sigs: u32,
    #[serde(rename = "type", default)]
    pub script_type: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Script classes the indexer knows how to attribute to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    PubKeyHash,
    /// Pay-to-pubkey-hash guarded by a `CHECKLOCKTIMEVERIFY` lock height.
    CltvPubKeyHash,
    Other,
}

impl ScriptPubKey {
    pub fn class(&self) -> ScriptClass {
        match self.script_type.as_str() {
            "pubkeyhash" => ScriptClass::PubKeyHash,
            "cltvpubkeyhash" => ScriptClass::CltvPubKeyHash,
            _ => ScriptClass::Other,
        }
    }
}

/// Subset of `getNodeInfo` the synchronizer consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    #[serde(default)]
    pub version: u64,
    #[serde(rename = "buildversion", default)]
    pub build_version: String,
    /// Confirmations the node recommends before trusting a block.
    #[serde(default)]
    pub confirmations: u64,
    #[serde(rename = "coinbasematurity", default)]
    pub coinbase_maturity: u64,
    #[serde(rename = "totalsubsidy", default)]
    pub total_subsidy: u64,
}

/// DAG coloring of a block as reported by `isBlue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockColor {
    Red,
    Blue,
    /// The node has not settled the block's color yet.
    Unknown,
}

impl BlockColor {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => BlockColor::Red,
            1 => BlockColor::Blue,
            _ => BlockColor::Unknown,
        }
    }
}

/// Error types for chain node RPC calls
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Node error {code}: {message}")]
    NodeError { code: i64, message: String },

    #[error("No information available about transaction: {0}")]
    TransactionUnknown(String),

    #[error("No data returned")]
    NoData,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RpcError {
    /// True when the node positively reports that it has no record of a transaction.
    ///
    /// Transport failures and other node errors are not "unknown": the transaction may
    /// still exist, we just could not find out.
    pub fn is_transaction_unknown(&self) -> bool {
        match self {
            RpcError::TransactionUnknown(_) => true,
            RpcError::NodeError { message, .. } => message.contains(TX_UNKNOWN_MARKER),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_deserializes_node_shape() {
        let raw = r#"{
            "hash": "b100",
            "txsvalid": true,
            "confirmations": 15,
            "order": 100,
            "height": 90,
            "parents": ["b99"],
            "transactions": [{
                "txid": "cb",
                "vin": [{"coinbase": "0100", "sequence": 4294967295}],
                "vout": [{
                    "coin": "MEER",
                    "coinid": 0,
                    "amount": 5000,
                    "scriptPubKey": {
                        "asm": "OP_DUP OP_HASH160 ab OP_EQUALVERIFY OP_CHECKSIG",
                        "hex": "76a914ab88ac",
                        "reqSigs": 1,
                        "type": "pubkeyhash",
                        "addresses": ["Tm1"]
                    }
                }]
            }]
        }"#;

        let block: Block = serde_json::from_str(raw).expect("block json");
        assert_eq!(block.order, 100);
        assert!(block.txs_valid);
        assert_eq!(block.parent_hashes, vec!["b99".to_string()]);
        let tx = &block.transactions[0];
        assert!(tx.has_coinbase_input());
        assert_eq!(tx.vout[0].script_pub_key.class(), ScriptClass::PubKeyHash);
        assert_eq!(tx.block_order, 0);
    }

    #[test]
    fn test_color_codes() {
        assert_eq!(BlockColor::from_code(0), BlockColor::Red);
        assert_eq!(BlockColor::from_code(1), BlockColor::Blue);
        assert_eq!(BlockColor::from_code(2), BlockColor::Unknown);
    }

    #[test]
    fn test_transaction_unknown_classification() {
        assert!(RpcError::TransactionUnknown("abc".into()).is_transaction_unknown());
        assert!(
            RpcError::NodeError {
                code: -5,
                message: format!("{TX_UNKNOWN_MARKER} abc"),
            }
            .is_transaction_unknown()
        );
        assert!(
            !RpcError::NodeError {
                code: -32603,
                message: "database is locked".into(),
            }
            .is_transaction_unknown()
        );
        assert!(!RpcError::NoData.is_transaction_unknown());
    }
}
