//! Main entry point for the playflow delivery service.
//!
//! This binary wires the full delivery engine from a TOML configuration:
//! durable store, executor client, proxy router, refund engine, delivery
//! worker, and the reconciliation jobs, plus the optional admin HTTP surface
//! for ops tooling.

use clap::Parser;
use playflow_config::Config;
use playflow_core::{Engine, EngineBuilder};
use std::path::PathBuf;
use std::sync::Arc;

mod server;

/// Command-line arguments for the delivery service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

/// Main entry point for the delivery service.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Builds the engine with the configured backends
/// 5. Runs the engine (and admin server) until interrupted
#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started playflow");

	let config = Config::from_file(&args.config)?;
	tracing::info!("Loaded configuration [{}]", config.engine.id);

	let engine = Arc::new(EngineBuilder::new(config.clone()).build()?);
	tracing::info!("Loaded delivery engine");

	let admin_enabled = config.admin.as_ref().is_some_and(|admin| admin.enabled);

	if admin_enabled {
		let admin_config = config
			.admin
			.clone()
			.expect("admin config checked just above");
		let admin_engine: Arc<Engine> = Arc::clone(&engine);

		tracing::info!("Starting engine and admin server");
		tokio::select! {
			result = engine.run() => {
				tracing::info!("Engine finished");
				result?;
			}
			result = server::start_server(admin_config, admin_engine) => {
				tracing::info!("Admin server finished");
				result?;
			}
		}
	} else {
		tracing::info!("Starting engine only");
		engine.run().await?;
	}

	tracing::info!("Stopped playflow");
	Ok(())
}
