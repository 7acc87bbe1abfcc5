use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use utxo_sync::config::{Config, StoreBackend};
use utxo_sync::rpc::{ChainClient, JsonRpcClient};
use utxo_sync::store::UtxoStore;
use utxo_sync::sync::UtxoSyncOrchestrator;

/// Follows a Qitmeer node and indexes the outputs of watched addresses.
#[derive(Parser, Debug)]
#[command(name = "utxo-sync", about, version)]
struct Cli {
	/// Path to the TOML configuration file
	#[arg(short, long, env = "UTXO_SYNC_CONFIG", default_value = "utxo-sync.toml")]
	config: PathBuf,

	/// Log filter directive; takes precedence over `RUST_LOG` and the config file
	#[arg(long)]
	log_filter: Option<String>,
}

/// `--log-filter` wins over `RUST_LOG`, which wins over the config file.
fn filter_directive(cli: Option<&str>, env: Option<String>, config: &str) -> String {
	cli.map(str::to_string)
		.or(env.filter(|directive| !directive.trim().is_empty()))
		.unwrap_or_else(|| config.to_string())
}

fn init_logging(cli_directive: Option<&str>, config_directive: &str) {
	let env = std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV).ok();
	let directive = filter_directive(cli_directive, env, config_directive);
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(directive))
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let client = Arc::new(JsonRpcClient::new(&config.rpc)?);
	info!("Connecting to node at {}", client.endpoint());
	let block_count = client.get_block_count().await?;
	let node = client.get_node_info().await?;
	info!(
		"Node {} at {} blocks reports {} confirmations, coinbase maturity {}",
		node.version, block_count, node.confirmations, node.coinbase_maturity
	);

	let store = Arc::new(match config.store.backend {
		StoreBackend::Sled => {
			info!("Opening store at {}", config.store.path.display());
			UtxoStore::open_sled(&config.store.path)?
		}
		StoreBackend::Memory => UtxoStore::in_memory()?,
	});

	let mut service = UtxoSyncOrchestrator::new(client, store, config.service_options());
	service.start().await?;

	tokio::select! {
		signal = tokio::signal::ctrl_c() => {
			signal?;
			info!("Shutdown requested");
		}
		failure = service.wait_for_indexer_failure() => {
			error!(
				"Indexer stopped at {:?} block order {}, shutting down",
				failure.stream, failure.block_order
			);
		}
	}

	let checkpoint = service.shutdown().await?;
	info!(
		"Stopped; next transaction order {}, next coinbase order {}, height {}",
		checkpoint.last_tx_block_order, checkpoint.last_coinbase_block_order, checkpoint.last_height
	);
	Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let config = match Config::from_file(&cli.config) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::FAILURE;
		}
	};
	init_logging(cli.log_filter.as_deref(), &config.log.filter);

	match run(config).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("UTXO sync failed: {}", e);
			ExitCode::FAILURE
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_cli_filter_beats_env_and_config() {
		assert_eq!(
			filter_directive(Some("debug"), Some("warn".to_string()), "info"),
			"debug"
		);
		assert_eq!(filter_directive(None, Some("warn".to_string()), "info"), "warn");
		assert_eq!(filter_directive(None, Some(" ".to_string()), "info"), "info");
		assert_eq!(filter_directive(None, None, "info"), "info");
	}
}
