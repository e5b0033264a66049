//! Configuration module for the playflow delivery engine.
//!
//! This module provides structures and utilities for managing engine
//! configuration. It supports loading configuration from TOML files and
//! provides validation to ensure all required configuration values are
//! properly set.

use playflow_types::ProxyTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the playflow engine.
///
/// Contains all sections required for the engine to operate: instance
/// identity, the durable store, the delivery worker, task planning, proxy
/// routing, the ledger, reconciliation cadence, the executor client, and the
/// admin surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Configuration specific to this engine instance.
	pub engine: EngineConfig,
	/// Configuration for the durable store backend.
	#[serde(default)]
	pub store: StoreConfig,
	/// Configuration for the delivery worker loop.
	#[serde(default)]
	pub worker: WorkerConfig,
	/// Configuration for task planning.
	#[serde(default)]
	pub planner: PlannerConfig,
	/// Configuration for proxy routing.
	#[serde(default)]
	pub router: RouterConfig,
	/// Configuration for the ledger and refund engine.
	#[serde(default)]
	pub ledger: LedgerConfig,
	/// Configuration for reconciliation and velocity checks.
	#[serde(default)]
	pub reconciliation: ReconciliationConfig,
	/// Configuration for the executor client.
	pub executor: ExecutorConfig,
	/// Configuration for the admin HTTP surface.
	pub admin: Option<AdminConfig>,
}

impl Config {
	/// Loads and validates configuration from a TOML file.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		Self::from_toml_str(&raw)
	}

	/// Parses and validates configuration from a TOML string.
	pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
		let config: Config = toml::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Rejects configurations the engine cannot run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.engine.id.is_empty() {
			return Err(ConfigError::Validation("engine.id must not be empty".into()));
		}
		if self.worker.batch_size == 0 {
			return Err(ConfigError::Validation("worker.batch_size must be positive".into()));
		}
		if self.worker.max_concurrent == 0 {
			return Err(ConfigError::Validation(
				"worker.max_concurrent must be positive".into(),
			));
		}
		if self.worker.cycle_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"worker.cycle_interval_ms must be positive".into(),
			));
		}
		if self.worker.orphan_threshold_secs == 0 {
			return Err(ConfigError::Validation(
				"worker.orphan_threshold_secs must be positive".into(),
			));
		}
		if self.planner.split_size == 0 {
			return Err(ConfigError::Validation("planner.split_size must be positive".into()));
		}
		if !(0.0..=1.0).contains(&self.router.min_score) {
			return Err(ConfigError::Validation(
				"router.min_score must be within [0, 1]".into(),
			));
		}
		if self.router.select_candidates == 0 {
			return Err(ConfigError::Validation(
				"router.select_candidates must be positive".into(),
			));
		}
		if self.router.candidate_fetch == 0 {
			return Err(ConfigError::Validation(
				"router.candidate_fetch must be positive".into(),
			));
		}
		match self.store.backend.as_str() {
			"memory" => {}
			"sqlite" => {
				if self.store.path.as_deref().is_none_or(str::is_empty) {
					return Err(ConfigError::Validation(
						"store.path is required for the sqlite backend".into(),
					));
				}
			}
			other => {
				return Err(ConfigError::Validation(format!(
					"unknown store backend '{other}'"
				)))
			}
		}
		match self.executor.backend.as_str() {
			"mock" => {}
			"http" => {
				if self.executor.endpoint.as_deref().is_none_or(str::is_empty) {
					return Err(ConfigError::Validation(
						"executor.endpoint is required for the http backend".into(),
					));
				}
			}
			other => {
				return Err(ConfigError::Validation(format!(
					"unknown executor backend '{other}'"
				)))
			}
		}
		Ok(())
	}
}

/// Configuration specific to this engine instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
	/// Identifier prefix for this instance; the worker id appends a random
	/// suffix so parallel instances stay distinguishable.
	pub id: String,
}

/// Configuration for the durable store backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
	/// Which backend to use: "memory" or "sqlite".
	#[serde(default = "default_store_backend")]
	pub backend: String,
	/// Database path, required for the sqlite backend.
	pub path: Option<String>,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			backend: default_store_backend(),
			path: None,
		}
	}
}

fn default_store_backend() -> String {
	"memory".to_string()
}

/// Configuration for the delivery worker loop.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
	/// Tasks claimed per cycle.
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
	/// Maximum in-flight tasks per worker instance.
	#[serde(default = "default_max_concurrent")]
	pub max_concurrent: usize,
	/// Cycle cadence in milliseconds.
	#[serde(default = "default_cycle_interval_ms")]
	pub cycle_interval_ms: u64,
	/// Age after which an EXECUTING task counts as orphaned, in seconds.
	#[serde(default = "default_orphan_threshold_secs")]
	pub orphan_threshold_secs: u64,
	/// Per-attempt executor call timeout, in seconds.
	#[serde(default = "default_execution_timeout_secs")]
	pub execution_timeout_secs: u64,
	/// Retry budget stamped onto newly planned tasks.
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			batch_size: default_batch_size(),
			max_concurrent: default_max_concurrent(),
			cycle_interval_ms: default_cycle_interval_ms(),
			orphan_threshold_secs: default_orphan_threshold_secs(),
			execution_timeout_secs: default_execution_timeout_secs(),
			max_attempts: default_max_attempts(),
		}
	}
}

fn default_batch_size() -> usize {
	10
}

fn default_max_concurrent() -> usize {
	5
}

fn default_cycle_interval_ms() -> u64 {
	10_000
}

/// Production default; dev environments shorten this to 30.
fn default_orphan_threshold_secs() -> u64 {
	120
}

fn default_execution_timeout_secs() -> u64 {
	30
}

fn default_max_attempts() -> u32 {
	3
}

/// Configuration for task planning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
	/// Units per task; the last task carries any remainder.
	#[serde(default = "default_split_size")]
	pub split_size: u64,
	/// Orders at or below this skip task planning and complete instantly
	/// (dev only).
	#[serde(default = "default_instant_threshold")]
	pub instant_threshold: u64,
	/// Disables the instant path globally.
	#[serde(default)]
	pub force_task_delivery: bool,
	/// Delivery window length used to spread task schedules, in seconds.
	#[serde(default = "default_delivery_window_secs")]
	pub delivery_window_secs: u64,
}

impl Default for PlannerConfig {
	fn default() -> Self {
		Self {
			split_size: default_split_size(),
			instant_threshold: default_instant_threshold(),
			force_task_delivery: false,
			delivery_window_secs: default_delivery_window_secs(),
		}
	}
}

fn default_split_size() -> u64 {
	500
}

fn default_instant_threshold() -> u64 {
	1000
}

fn default_delivery_window_secs() -> u64 {
	3600
}

/// Configuration for proxy routing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
	/// Whether routing is enabled at all; when disabled every task takes the
	/// transient-failure path with reason "no proxy available".
	#[serde(default = "default_router_enabled")]
	pub enabled: bool,
	/// Minimum composite score a candidate must reach to be selectable.
	#[serde(default = "default_min_score")]
	pub min_score: f64,
	/// Top-N candidates entering the weighted random pick.
	#[serde(default = "default_select_candidates")]
	pub select_candidates: usize,
	/// Candidates fetched from the store per selection.
	#[serde(default = "default_candidate_fetch")]
	pub candidate_fetch: usize,
	/// Sticky session lifetime in seconds.
	#[serde(default = "default_sticky_ttl_secs")]
	pub sticky_ttl_secs: u64,
	/// Per-tier breaker failure thresholds; unlisted tiers use the built-in
	/// defaults.
	#[serde(default)]
	pub breaker_thresholds: HashMap<String, u32>,
	/// Rolling failure window feeding the tier breakers, in seconds.
	#[serde(default = "default_breaker_window_secs")]
	pub breaker_window_secs: u64,
	/// How long an opened breaker stays open, in seconds.
	#[serde(default = "default_breaker_open_secs")]
	pub breaker_open_secs: u64,
	/// Consecutive half-open successes required to close a breaker.
	#[serde(default = "default_breaker_success_threshold")]
	pub breaker_success_threshold: u32,
}

impl RouterConfig {
	/// Breaker failure threshold for a tier, honoring configured overrides.
	pub fn breaker_threshold_for(&self, tier: ProxyTier) -> u32 {
		if let Some(&threshold) = self.breaker_thresholds.get(tier.as_str()) {
			return threshold;
		}
		match tier {
			ProxyTier::Mobile => 15,
			ProxyTier::Residential => 12,
			ProxyTier::Isp => 10,
			ProxyTier::Datacenter => 8,
			ProxyTier::Tor => 5,
		}
	}
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			enabled: default_router_enabled(),
			min_score: default_min_score(),
			select_candidates: default_select_candidates(),
			candidate_fetch: default_candidate_fetch(),
			sticky_ttl_secs: default_sticky_ttl_secs(),
			breaker_thresholds: HashMap::new(),
			breaker_window_secs: default_breaker_window_secs(),
			breaker_open_secs: default_breaker_open_secs(),
			breaker_success_threshold: default_breaker_success_threshold(),
		}
	}
}

fn default_router_enabled() -> bool {
	true
}

fn default_min_score() -> f64 {
	0.7
}

fn default_select_candidates() -> usize {
	3
}

fn default_candidate_fetch() -> usize {
	50
}

fn default_sticky_ttl_secs() -> u64 {
	1800
}

fn default_breaker_window_secs() -> u64 {
	60
}

fn default_breaker_open_secs() -> u64 {
	300
}

fn default_breaker_success_threshold() -> u32 {
	3
}

/// Configuration for the ledger and refund engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
	/// Issue credits on permanent failure. Test environments may disable
	/// this; production always has refunds enabled.
	#[serde(default = "default_refund_enabled")]
	pub refund_enabled: bool,
}

impl Default for LedgerConfig {
	fn default() -> Self {
		Self {
			refund_enabled: default_refund_enabled(),
		}
	}
}

fn default_refund_enabled() -> bool {
	true
}

/// Configuration for reconciliation and velocity checks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
	/// Reconciliation cadence, in seconds.
	#[serde(default = "default_reconciliation_interval_secs")]
	pub interval_secs: u64,
	/// Velocity check cadence, in seconds.
	#[serde(default = "default_velocity_interval_secs")]
	pub velocity_interval_secs: u64,
	/// Refund events within the velocity window that flag a user.
	#[serde(default = "default_velocity_threshold")]
	pub velocity_threshold: u64,
}

impl Default for ReconciliationConfig {
	fn default() -> Self {
		Self {
			interval_secs: default_reconciliation_interval_secs(),
			velocity_interval_secs: default_velocity_interval_secs(),
			velocity_threshold: default_velocity_threshold(),
		}
	}
}

fn default_reconciliation_interval_secs() -> u64 {
	900
}

fn default_velocity_interval_secs() -> u64 {
	3600
}

fn default_velocity_threshold() -> u64 {
	5
}

/// Configuration for the executor client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
	/// Which backend to use: "http" or "mock".
	pub backend: String,
	/// Executor endpoint URL, required for the http backend.
	pub endpoint: Option<String>,
}

/// Configuration for the admin HTTP surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
	/// Whether the admin server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_admin_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_admin_port")]
	pub port: u16,
}

fn default_admin_host() -> String {
	"127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
	9090
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
		[engine]
		id = "playflow-dev"

		[executor]
		backend = "mock"
	"#;

	#[test]
	fn minimal_config_gets_defaults() {
		let config = Config::from_toml_str(MINIMAL).unwrap();
		assert_eq!(config.worker.batch_size, 10);
		assert_eq!(config.worker.max_concurrent, 5);
		assert_eq!(config.worker.cycle_interval_ms, 10_000);
		assert_eq!(config.worker.orphan_threshold_secs, 120);
		assert_eq!(config.planner.split_size, 500);
		assert_eq!(config.planner.instant_threshold, 1000);
		assert!(!config.planner.force_task_delivery);
		assert!(config.ledger.refund_enabled);
		assert_eq!(config.reconciliation.interval_secs, 900);
		assert_eq!(config.reconciliation.velocity_threshold, 5);
		assert_eq!(config.router.min_score, 0.7);
		assert_eq!(config.router.select_candidates, 3);
		assert_eq!(config.store.backend, "memory");
	}

	#[test]
	fn breaker_thresholds_fall_back_per_tier() {
		let config = Config::from_toml_str(MINIMAL).unwrap();
		assert_eq!(config.router.breaker_threshold_for(ProxyTier::Mobile), 15);
		assert_eq!(config.router.breaker_threshold_for(ProxyTier::Datacenter), 8);
		assert_eq!(config.router.breaker_threshold_for(ProxyTier::Tor), 5);

		let raw = format!("{MINIMAL}\n[router.breaker_thresholds]\nTOR = 9\n");
		let config = Config::from_toml_str(&raw).unwrap();
		assert_eq!(config.router.breaker_threshold_for(ProxyTier::Tor), 9);
		assert_eq!(config.router.breaker_threshold_for(ProxyTier::Mobile), 15);
	}

	#[test]
	fn sqlite_backend_requires_path() {
		let raw = r#"
			[engine]
			id = "playflow-dev"

			[store]
			backend = "sqlite"

			[executor]
			backend = "mock"
		"#;
		assert!(matches!(
			Config::from_toml_str(raw),
			Err(ConfigError::Validation(_))
		));
	}

	#[test]
	fn http_executor_requires_endpoint() {
		let raw = r#"
			[engine]
			id = "playflow-dev"

			[executor]
			backend = "http"
		"#;
		assert!(matches!(
			Config::from_toml_str(raw),
			Err(ConfigError::Validation(_))
		));
	}

	#[test]
	fn rejects_zero_batch_size() {
		let raw = r#"
			[engine]
			id = "playflow-dev"

			[worker]
			batch_size = 0

			[executor]
			backend = "mock"
		"#;
		assert!(matches!(
			Config::from_toml_str(raw),
			Err(ConfigError::Validation(_))
		));
	}

	#[test]
	fn unknown_backend_is_rejected() {
		let raw = r#"
			[engine]
			id = "playflow-dev"

			[store]
			backend = "redis"

			[executor]
			backend = "mock"
		"#;
		assert!(matches!(
			Config::from_toml_str(raw),
			Err(ConfigError::Validation(_))
		));
	}
}
