//! Core engine for the playflow delivery system.
//!
//! This module provides the orchestration logic: order intake (validation,
//! debit, task planning in one transaction), the delivery worker loop, the
//! reconciliation and velocity jobs, the invariant validator, and the builder
//! that wires every service from configuration. Components coordinate only
//! through the durable store; there is no leader election and no distributed
//! locking.

use chrono::{Duration as ChronoDuration, Utc};
use playflow_config::Config;
use playflow_executor::implementations::http::HttpExecutor;
use playflow_executor::implementations::mock::{InjectionHandle, MockExecutor};
use playflow_executor::ExecutorService;
use playflow_ledger::{LedgerError, RefundEngine};
use playflow_planner::{PlannerError, TaskPlanner};
use playflow_router::{ProxyRouter, RouterError, RouterOptions};
use playflow_store::implementations::memory::MemoryStore;
use playflow_store::implementations::sqlite::SqliteStore;
use playflow_store::{CreateOrderOutcome, Store, StoreError, StoreInterface};
use playflow_types::{truncate_id, Order, OrderStatus, OrderValidationError};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

pub mod reconciliation;
pub mod validator;
pub mod worker;

pub use reconciliation::{ReconcileReport, ReconciliationJob};
pub use validator::{InvariantReport, InvariantValidator};
pub use worker::{CycleReport, DeliveryWorker, WorkerOptions, WorkerStatus};

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	/// Error related to configuration issues.
	#[error("Configuration error: {0}")]
	Config(String),
	/// Invalid order request.
	#[error("Invalid order: {0}")]
	InvalidOrder(#[from] OrderValidationError),
	/// Error from the durable store.
	#[error("Store error: {0}")]
	Store(#[from] StoreError),
	/// Error from the task planner.
	#[error("Planner error: {0}")]
	Planner(#[from] PlannerError),
	/// Error from the proxy router.
	#[error("Router error: {0}")]
	Router(#[from] RouterError),
	/// Error from the ledger.
	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),
}

/// An order intake request, resolved upstream of the core (tenancy,
/// pricing tier, catalog).
#[derive(Debug, Clone)]
pub struct OrderRequest {
	pub user_id: Uuid,
	pub target_url: String,
	pub quantity: u64,
	pub price_per_unit: Decimal,
	/// Client-supplied idempotency key; duplicates return the first order.
	pub external_key: Option<String>,
}

/// Main engine coordinating intake, delivery, and reconciliation.
pub struct Engine {
	config: Config,
	store: Store,
	planner: TaskPlanner,
	ledger: Arc<RefundEngine>,
	worker: Arc<DeliveryWorker>,
	reconciliation: Arc<ReconciliationJob>,
	validator: InvariantValidator,
	/// Present when the mock executor is active; drives the admin
	/// failure-injection toggles.
	injection: Option<InjectionHandle>,
}

impl Engine {
	/// Accepts an order: validates it, debits the user, and plans its task
	/// batch, all in one store transaction.
	///
	/// Small orders take the instant-completion path when the planner allows
	/// it. A duplicate `(user_id, external_key)` returns the existing order.
	#[instrument(skip_all, fields(user_id = %truncate_id(&request.user_id.to_string())))]
	pub async fn submit_order(
		&self,
		request: OrderRequest,
	) -> Result<CreateOrderOutcome, EngineError> {
		let mut order = Order::new(
			request.user_id,
			request.target_url,
			request.quantity,
			request.price_per_unit,
			request.external_key,
		)?;
		let now = Utc::now();

		if self.planner.is_instant(order.quantity) {
			let outcome = self.store.create_order_with_tasks(&order, &[]).await?;
			return match outcome {
				CreateOrderOutcome::Created(created) => {
					let completed =
						self.store.complete_order_instantly(created.id, now).await?;
					tracing::info!(
						order_id = %truncate_id(&completed.id.to_string()),
						quantity = completed.quantity,
						"Order completed instantly"
					);
					Ok(CreateOrderOutcome::Created(completed))
				}
				existing => Ok(existing),
			};
		}

		order.status = OrderStatus::Running;
		order.started_at = Some(now);
		order.estimated_completion_at = Some(
			now + ChronoDuration::seconds(self.config.planner.delivery_window_secs as i64),
		);
		let tasks = self.planner.plan(&order)?;
		let outcome = self.store.create_order_with_tasks(&order, &tasks).await?;
		match &outcome {
			CreateOrderOutcome::Created(created) => {
				tracing::info!(
					order_id = %truncate_id(&created.id.to_string()),
					quantity = created.quantity,
					tasks = tasks.len(),
					"Order accepted"
				);
			}
			CreateOrderOutcome::Existing(existing) => {
				tracing::info!(
					order_id = %truncate_id(&existing.id.to_string()),
					"Duplicate external key, returning existing order"
				);
			}
		}
		Ok(outcome)
	}

	/// Admin cancellation: abandons every non-terminal task, refunds them
	/// through the standard idempotent path, and marks the order CANCELLED.
	#[instrument(skip_all, fields(order_id = %truncate_id(&order_id.to_string())))]
	pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, EngineError> {
		let abandoned = self
			.store
			.abandon_open_tasks(order_id, "cancelled by admin")
			.await?;
		let refunded = self.ledger.refund_abandoned(&abandoned).await?;
		let order = self.store.set_order_cancelled(order_id, Utc::now()).await?;
		tracing::info!(
			abandoned = abandoned.len(),
			refunded,
			"Order cancelled"
		);
		Ok(order)
	}

	/// Runs the engine until interrupted: worker loop plus the
	/// reconciliation timers, torn down in reverse start order.
	pub async fn run(&self) -> Result<(), EngineError> {
		let startup_orphans = self.startup_orphan_count().await?;
		if startup_orphans > 0 {
			tracing::warn!(
				count = startup_orphans,
				"Found orphaned EXECUTING tasks from a previous run; the cycle query will reclaim them"
			);
		}

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let reconciliation = tokio::spawn(
			Arc::clone(&self.reconciliation).run(shutdown_rx.clone()),
		);
		let worker = tokio::spawn(Arc::clone(&self.worker).run(shutdown_rx));

		tokio::signal::ctrl_c()
			.await
			.map_err(|e| EngineError::Config(format!("signal handler failed: {e}")))?;
		tracing::info!("Shutdown signal received");

		shutdown_tx.send(true).ok();
		worker.await.ok();
		reconciliation.await.ok();
		Ok(())
	}

	/// EXECUTING tasks already past the orphan threshold, counted at startup.
	pub async fn startup_orphan_count(&self) -> Result<u64, EngineError> {
		let cutoff = Utc::now()
			- ChronoDuration::seconds(self.config.worker.orphan_threshold_secs as i64);
		Ok(self.store.executing_older_than(cutoff).await?)
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	pub fn worker(&self) -> &Arc<DeliveryWorker> {
		&self.worker
	}

	pub fn validator(&self) -> &InvariantValidator {
		&self.validator
	}

	pub fn reconciliation(&self) -> &Arc<ReconciliationJob> {
		&self.reconciliation
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// The failure-injection handle, when the mock executor is configured.
	pub fn injection(&self) -> Option<&InjectionHandle> {
		self.injection.as_ref()
	}

	/// Orphan probe for the admin surface.
	pub async fn orphan_count(&self) -> Result<u64, EngineError> {
		self.startup_orphan_count().await
	}
}

/// Builder constructing an [`Engine`] from configuration.
///
/// Backends are selected by the configuration's `store.backend` and
/// `executor.backend` keys; each loaded component is logged the way the rest
/// of the fleet expects.
pub struct EngineBuilder {
	config: Config,
}

impl EngineBuilder {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	pub fn build(self) -> Result<Engine, EngineError> {
		let config = self.config;

		let store: Store = match config.store.backend.as_str() {
			"memory" => Arc::new(MemoryStore::new()),
			"sqlite" => {
				let path = config
					.store
					.path
					.as_deref()
					.ok_or_else(|| EngineError::Config("store.path missing".into()))?;
				Arc::new(SqliteStore::open(path)?)
			}
			other => {
				return Err(EngineError::Config(format!(
					"unknown store backend '{other}'"
				)))
			}
		};
		tracing::info!(component = "store", implementation = %config.store.backend, "Loaded");

		let mut injection = None;
		let backend: Box<dyn playflow_executor::ExecutorInterface> =
			match config.executor.backend.as_str() {
				"http" => {
					let endpoint = config
						.executor
						.endpoint
						.as_deref()
						.ok_or_else(|| EngineError::Config("executor.endpoint missing".into()))?;
					let transport_timeout =
						Duration::from_secs(config.worker.execution_timeout_secs);
					Box::new(
						HttpExecutor::new(endpoint, transport_timeout)
							.map_err(|e| EngineError::Config(e.to_string()))?,
					)
				}
				"mock" => {
					let handle = InjectionHandle::default();
					injection = Some(handle.clone());
					Box::new(MockExecutor::new(handle))
				}
				other => {
					return Err(EngineError::Config(format!(
						"unknown executor backend '{other}'"
					)))
				}
			};
		let executor = Arc::new(ExecutorService::new(
			backend,
			Duration::from_secs(config.worker.execution_timeout_secs),
		));
		tracing::info!(component = "executor", implementation = %config.executor.backend, "Loaded");

		let mut tier_failure_thresholds = HashMap::new();
		for tier in playflow_types::ProxyTier::all() {
			tier_failure_thresholds.insert(tier, config.router.breaker_threshold_for(tier));
		}
		let router = Arc::new(ProxyRouter::new(
			store.clone(),
			RouterOptions {
				enabled: config.router.enabled,
				min_score: config.router.min_score,
				select_candidates: config.router.select_candidates,
				candidate_fetch: config.router.candidate_fetch,
				sticky_ttl: Duration::from_secs(config.router.sticky_ttl_secs),
				breaker_window: Duration::from_secs(config.router.breaker_window_secs),
				breaker_open: Duration::from_secs(config.router.breaker_open_secs),
				breaker_success_threshold: config.router.breaker_success_threshold,
				tier_failure_thresholds,
			},
		));
		tracing::info!(component = "router", enabled = config.router.enabled, "Loaded");

		let ledger = Arc::new(RefundEngine::new(
			store.clone(),
			config.ledger.refund_enabled,
		));
		tracing::info!(component = "ledger", refunds = config.ledger.refund_enabled, "Loaded");

		let planner = TaskPlanner::new(
			config.planner.split_size,
			config.planner.instant_threshold,
			config.planner.force_task_delivery,
			config.worker.max_attempts,
		);

		let worker = Arc::new(DeliveryWorker::new(
			&config.engine.id,
			store.clone(),
			Arc::clone(&router),
			executor,
			Arc::clone(&ledger),
			WorkerOptions {
				batch_size: config.worker.batch_size,
				max_concurrent: config.worker.max_concurrent,
				cycle_interval: Duration::from_millis(config.worker.cycle_interval_ms),
				orphan_threshold: Duration::from_secs(config.worker.orphan_threshold_secs),
			},
		));
		tracing::info!(component = "worker", worker_id = %worker.worker_id(), "Loaded");

		let reconciliation = Arc::new(ReconciliationJob::new(
			store.clone(),
			Duration::from_secs(config.reconciliation.interval_secs),
			Duration::from_secs(config.reconciliation.velocity_interval_secs),
			config.reconciliation.velocity_threshold,
		));

		let validator = InvariantValidator::new(
			store.clone(),
			Duration::from_secs(config.worker.orphan_threshold_secs)
				+ Duration::from_millis(config.worker.cycle_interval_ms),
		);

		Ok(Engine {
			config,
			store,
			planner,
			ledger,
			worker,
			reconciliation,
			validator,
			injection,
		})
	}
}
