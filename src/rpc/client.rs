//!
//! JSON-RPC client for the chain node.
//!
//! This module defines the `ChainClient` contract the synchronizer and reconciler depend on, and
//! `JsonRpcClient`, its HTTP(S) implementation. Requests are JSON-RPC 2.0 posted with basic
//! auth; the node signals failures through the `error` member of the response body.

use super::types::*;
use crate::config::RpcConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// Read and broadcast operations the indexer needs from a chain node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
	/// Fetch a block with its full transactions by DAG order.
	async fn get_block_by_order(&self, order: u64) -> Result<Block, RpcError>;

	/// Fetch a block with its full transactions by node-local block id.
	async fn get_block_by_id(&self, id: u64) -> Result<Block, RpcError>;

	/// Fetch a transaction in verbose form.
	///
	/// # Errors
	/// Returns `RpcError::TransactionUnknown` when the node has no record of `txid`. Every
	/// other error means the answer is not known.
	async fn get_transaction(&self, txid: &str) -> Result<Transaction, RpcError>;

	async fn get_node_info(&self) -> Result<NodeInfo, RpcError>;

	/// Query the DAG color of a block.
	async fn is_blue(&self, hash: &str) -> Result<BlockColor, RpcError>;

	/// Broadcast a raw hex-encoded transaction, returning its txid.
	async fn send_transaction(&self, raw_hex: &str) -> Result<String, RpcError>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
	async fn get_block_by_order(&self, order: u64) -> Result<Block, RpcError> {
		(**self).get_block_by_order(order).await
	}

	async fn get_block_by_id(&self, id: u64) -> Result<Block, RpcError> {
		(**self).get_block_by_id(id).await
	}

	async fn get_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
		(**self).get_transaction(txid).await
	}

	async fn get_node_info(&self) -> Result<NodeInfo, RpcError> {
		(**self).get_node_info().await
	}

	async fn is_blue(&self, hash: &str) -> Result<BlockColor, RpcError> {
		(**self).is_blue(hash).await
	}

	async fn send_transaction(&self, raw_hex: &str) -> Result<String, RpcError> {
		(**self).send_transaction(raw_hex).await
	}
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
	#[serde(default)]
	result: Option<Value>,
	#[serde(default)]
	error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
	#[serde(default)]
	code: i64,
	#[serde(default)]
	message: String,
}

/// Chain node JSON-RPC client
#[derive(Clone)]
pub struct JsonRpcClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Full endpoint URL including scheme.
	endpoint: String,
	user: String,
	password: String,
	/// Monotonic JSON-RPC request id.
	next_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
	/// Create a new RPC client.
	///
	/// # Arguments
	/// * `config` - Node address, credentials, TLS and timeout settings.
	///
	/// # Returns
	/// A new `JsonRpcClient`, or an `RpcError` if the HTTP client cannot be built.
	pub fn new(config: &RpcConfig) -> Result<Self, RpcError> {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(config.timeout_secs))
			.danger_accept_invalid_certs(config.accept_invalid_certs)
			.build()?;

		let scheme = if config.tls { "https" } else { "http" };

		Ok(Self {
			http_client,
			endpoint: format!("{}://{}", scheme, config.host),
			user: config.user.clone(),
			password: config.password.clone(),
			next_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	/// Execute a JSON-RPC call and deserialize its `result`.
	///
	/// # Arguments
	/// * `method` - RPC method name.
	/// * `params` - Positional parameters.
	///
	/// # Returns
	/// The decoded result, `RpcError::NodeError` for an `error` response, or
	/// `RpcError::NoData` when the node returned a null result.
	pub async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Vec<Value>,
	) -> Result<T, RpcError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request_body = json!({
			"jsonrpc": "2.0",
			"method": method,
			"params": params,
			"id": id,
		});

		debug!("RPC request {} ({})", method, id);

		let response = self
			.http_client
			.post(&self.endpoint)
			.basic_auth(&self.user, Some(&self.password))
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		let status = response.status();
		let body = response.text().await?;

		// Nodes commonly answer errors with a 500 and a JSON-RPC error body, so try the body first.
		let parsed: JsonRpcResponse = match serde_json::from_str(&body) {
			Ok(parsed) => parsed,
			Err(e) if status.is_success() => return Err(RpcError::JsonError(e)),
			Err(_) => {
				error!("RPC {} failed with HTTP {}", method, status);
				return Err(RpcError::UnexpectedResponse(format!(
					"HTTP error: {}",
					status
				)));
			}
		};

		if let Some(err) = parsed.error {
			return Err(RpcError::NodeError {
				code: err.code,
				message: err.message,
			});
		}

		match parsed.result {
			None | Some(Value::Null) => Err(RpcError::NoData),
			Some(value) => Ok(serde_json::from_value(value)?),
		}
	}

	/// Current number of blocks known to the node.
	pub async fn get_block_count(&self) -> Result<u64, RpcError> {
		self.call("getBlockCount", vec![]).await
	}
}

#[async_trait]
impl ChainClient for JsonRpcClient {
	async fn get_block_by_order(&self, order: u64) -> Result<Block, RpcError> {
		self.call("getBlockByOrder", vec![json!(order), json!(true)])
			.await
	}

	async fn get_block_by_id(&self, id: u64) -> Result<Block, RpcError> {
		self.call("getBlockByID", vec![json!(id), json!(true)]).await
	}

	async fn get_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
		self.call("getRawTransaction", vec![json!(txid), json!(true)])
			.await
			.map_err(|e| {
				if e.is_transaction_unknown() {
					RpcError::TransactionUnknown(txid.to_string())
				} else {
					e
				}
			})
	}

	async fn get_node_info(&self) -> Result<NodeInfo, RpcError> {
		self.call("getNodeInfo", vec![]).await
	}

	async fn is_blue(&self, hash: &str) -> Result<BlockColor, RpcError> {
		let code: i64 = self.call("isBlue", vec![json!(hash)]).await?;
		Ok(BlockColor::from_code(code))
	}

	async fn send_transaction(&self, raw_hex: &str) -> Result<String, RpcError> {
		let raw = raw_hex.trim();
		if raw.is_empty() {
			return Err(RpcError::UnexpectedResponse(
				"refusing to broadcast an empty transaction".to_string(),
			));
		}
		self.call("sendRawTransaction", vec![json!(raw), json!(false)])
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(tls: bool) -> RpcConfig {
		RpcConfig {
			host: "127.0.0.1:18131".to_string(),
			tls,
			..RpcConfig::default()
		}
	}

	#[test]
	fn test_endpoint_scheme_follows_tls_flag() {
		let plain = JsonRpcClient::new(&config(false)).expect("client");
		assert_eq!(plain.endpoint(), "http://127.0.0.1:18131");

		let secure = JsonRpcClient::new(&config(true)).expect("client");
		assert_eq!(secure.endpoint(), "https://127.0.0.1:18131");
	}

	#[test]
	fn test_response_body_with_error_member() {
		let body = r#"{"jsonrpc":"2.0","id":1,"result":null,"error":{"code":-5,"message":"No information available about transaction abc"}}"#;
		let parsed: JsonRpcResponse = serde_json::from_str(body).expect("response");
		let err = parsed.error.expect("error member");
		assert_eq!(err.code, -5);
		assert!(err.message.contains(TX_UNKNOWN_MARKER));
	}

	#[tokio::test]
	async fn test_send_transaction_rejects_blank_payload() {
		let client = JsonRpcClient::new(&config(false)).expect("client");
		let err = client
			.send_transaction("  \n")
			.await
			.expect_err("blank payload");
		assert!(matches!(err, RpcError::UnexpectedResponse(_)));
	}
}
