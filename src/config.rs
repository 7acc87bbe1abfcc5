//! Configuration for the UTXO sync daemon.

use crate::sync::reconcile::ReconcileOptions;
use crate::sync::{ServiceOptions, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Chain node connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcConfig {
    /// Node address as `host:port`
    #[serde(default = "default_rpc_host")]
    pub host: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Connect over https
    #[serde(default)]
    pub tls: bool,

    /// Accept self-signed node certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

/// Synchronization and reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Block order to start from on an empty store
    #[serde(default)]
    pub start_order: u64,

    /// Overrides the node's confirmation threshold; 0 uses the node's value
    #[serde(default)]
    pub confirmations: u64,

    /// Capacity of the batch queue between synchronizer and indexer
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,

    /// Block orders re-evaluated below the stored cursor on start
    #[serde(default = "default_rewind_count")]
    pub rewind_count: u64,

    /// Seconds to wait before re-evaluating a deferred block
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Follow coinbase outputs on a separate stream gated by coinbase maturity
    #[serde(default)]
    pub track_coinbase: bool,

    /// Seconds between spent-ledger reconciliation passes
    #[serde(default = "default_reconcile_period")]
    pub reconcile_period_secs: u64,

    /// Confirmations after which a recorded spend is final; 0 keeps ledger entries
    #[serde(default = "default_durable_confirmations")]
    pub durable_confirmations: u64,

    /// Watched addresses registered on start
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sled,
    /// Nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_rpc_host() -> String {
    "127.0.0.1:18131".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_queue_len() -> usize {
    100
}

fn default_rewind_count() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    30
}

fn default_reconcile_period() -> u64 {
    3 * 60 * 60
}

fn default_durable_confirmations() -> u64 {
    720
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            user: String::new(),
            password: String::new(),
            tls: false,
            accept_invalid_certs: false,
            timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_order: 0,
            confirmations: 0,
            queue_len: default_queue_len(),
            rewind_count: default_rewind_count(),
            retry_delay_secs: default_retry_delay(),
            track_coinbase: false,
            reconcile_period_secs: default_reconcile_period(),
            durable_confirmations: default_durable_confirmations(),
            addresses: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            backend: StoreBackend::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.host.trim().is_empty() {
            return Err(ConfigError::Invalid("rpc.host must not be empty".to_string()));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(ConfigError::Invalid("rpc.timeout_secs must be positive".to_string()));
        }
        if self.sync.queue_len == 0 {
            return Err(ConfigError::Invalid("sync.queue_len must be positive".to_string()));
        }
        if self.sync.retry_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.retry_delay_secs must be positive".to_string(),
            ));
        }
        if self.sync.reconcile_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.reconcile_period_secs must be positive".to_string(),
            ));
        }
        if let Some(address) = self.sync.addresses.iter().find(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "sync.addresses contains an empty entry {:?}",
                address
            )));
        }
        Ok(())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            queue_len: self.sync.queue_len,
            confirmations: Some(self.sync.confirmations).filter(|count| *count != 0),
            rewind_count: self.sync.rewind_count,
            retry_delay: Duration::from_secs(self.sync.retry_delay_secs),
            track_coinbase: self.sync.track_coinbase,
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            period: Duration::from_secs(self.sync.reconcile_period_secs),
            durable_confirmations: self.sync.durable_confirmations,
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            start_order: self.sync.start_order,
            addresses: self.sync.addresses.clone(),
            sync: self.sync_options(),
            reconcile: self.reconcile_options(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.queue_len, 100);
        assert_eq!(config.sync.rewind_count, 5);
        assert_eq!(config.sync.reconcile_period_secs, 10_800);
        assert_eq!(config.store.backend, StoreBackend::Sled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [rpc]
            host = "node.example:18131"
            user = "admin"
            password = "secret"
            tls = true

            [sync]
            start_order = 1200
            confirmations = 3
            addresses = ["TmA", "TmB"]

            [store]
            backend = "memory"
            "#,
        )
        .expect("config");

        assert_eq!(config.rpc.host, "node.example:18131");
        assert!(config.rpc.tls);
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.sync.addresses.len(), 2);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.log.filter, "info");

        let options = config.service_options();
        assert_eq!(options.start_order, 1200);
        assert_eq!(options.sync.confirmations, Some(3));
        assert_eq!(options.sync.retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_confirmations_defers_to_node() {
        assert_eq!(Config::default().sync_options().confirmations, None);
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let err = Config::from_toml("[sync]\nqueue_len = 0\n").expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        let err = Config::from_toml("[store]\nbackend = \"rocks\"\n").expect_err("invalid");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
