//! Delivery worker loop.
//!
//! A scheduled, overlap-guarded loop: each cycle claims ready tasks with a
//! single conditional update per task, dispatches them through the router to
//! the external executor under bounded concurrency, and retires them as
//! completed, retrying, or permanently failed. Orphan recovery is the same
//! claim applied to EXECUTING tasks whose stamp aged past the orphan
//! threshold. Executor failures never abort a cycle; store write failures
//! halt only the task they belong to.

use crate::EngineError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use playflow_executor::ExecutorService;
use playflow_ledger::RefundEngine;
use playflow_router::{Operation, ProxyRouter, RouteRequest};
use playflow_store::{ClaimOutcome, OrderProgress, Store, StoreError, StoreInterface};
use playflow_types::{truncate_id, ExecutionRequest, Task, TaskStatus};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::instrument;
use uuid::Uuid;

/// Base delay of the retry backoff schedule.
const BACKOFF_BASE_SECS: i64 = 30;

/// Backoff doubling stops after 2^4.
const BACKOFF_MAX_EXPONENT: u32 = 4;

/// Retry delay for a task that failed on its `attempts`-th attempt:
/// `30s * 2^min(attempts - 1, 4)`.
pub fn retry_backoff(attempts: u32) -> ChronoDuration {
	let exponent = attempts.saturating_sub(1).min(BACKOFF_MAX_EXPONENT);
	ChronoDuration::seconds(BACKOFF_BASE_SECS << exponent)
}

/// Tuning knobs for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
	pub batch_size: usize,
	pub max_concurrent: usize,
	pub cycle_interval: Duration,
	pub orphan_threshold: Duration,
}

/// Activity counters for one worker instance, exposed on the admin surface.
#[derive(Debug, Default)]
pub struct WorkerStats {
	processed: AtomicU64,
	completed: AtomicU64,
	failed_transient: AtomicU64,
	failed_permanent: AtomicU64,
	retries: AtomicU64,
	recovered_orphans: AtomicU64,
	claims_lost: AtomicU64,
}

/// Point-in-time snapshot of [`WorkerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
	pub worker_id: String,
	pub started_at: DateTime<Utc>,
	pub processed: u64,
	pub completed: u64,
	pub failed_transient: u64,
	pub failed_permanent: u64,
	pub retries: u64,
	pub recovered_orphans: u64,
	pub claims_lost: u64,
}

/// What one cycle did; returned so tests and callers can drive the loop
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
	/// The previous cycle was still running; this tick was dropped.
	pub skipped_reentry: bool,
	/// Tasks the readiness query returned.
	pub due: usize,
	/// Tasks this worker actually claimed and dispatched.
	pub dispatched: usize,
}

/// One delivery worker instance.
pub struct DeliveryWorker {
	worker_id: String,
	store: Store,
	router: Arc<ProxyRouter>,
	executor: Arc<ExecutorService>,
	ledger: Arc<RefundEngine>,
	options: WorkerOptions,
	cycle_running: AtomicBool,
	concurrency: Arc<Semaphore>,
	stats: WorkerStats,
	started_at: DateTime<Utc>,
}

impl DeliveryWorker {
	pub fn new(
		instance_prefix: &str,
		store: Store,
		router: Arc<ProxyRouter>,
		executor: Arc<ExecutorService>,
		ledger: Arc<RefundEngine>,
		options: WorkerOptions,
	) -> Self {
		let worker_id = derive_worker_id(instance_prefix);
		let concurrency = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
		Self {
			worker_id,
			store,
			router,
			executor,
			ledger,
			options,
			cycle_running: AtomicBool::new(false),
			concurrency,
			stats: WorkerStats::default(),
			started_at: Utc::now(),
		}
	}

	pub fn worker_id(&self) -> &str {
		&self.worker_id
	}

	pub fn status(&self) -> WorkerStatus {
		WorkerStatus {
			worker_id: self.worker_id.clone(),
			started_at: self.started_at,
			processed: self.stats.processed.load(Ordering::Relaxed),
			completed: self.stats.completed.load(Ordering::Relaxed),
			failed_transient: self.stats.failed_transient.load(Ordering::Relaxed),
			failed_permanent: self.stats.failed_permanent.load(Ordering::Relaxed),
			retries: self.stats.retries.load(Ordering::Relaxed),
			recovered_orphans: self.stats.recovered_orphans.load(Ordering::Relaxed),
			claims_lost: self.stats.claims_lost.load(Ordering::Relaxed),
		}
	}

	/// Runs the worker until the shutdown signal flips.
	///
	/// Ticks that land while a cycle is still running are dropped, not
	/// queued; the cycle guard enforces the same within `run_cycle` for
	/// callers driving cycles directly.
	pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut interval = tokio::time::interval(self.options.cycle_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		tracing::info!(worker_id = %self.worker_id, "Delivery worker started");
		loop {
			tokio::select! {
				_ = interval.tick() => {
					if let Err(e) = self.run_cycle().await {
						tracing::error!(worker_id = %self.worker_id, error = %e, "Cycle failed");
					}
				}
				_ = shutdown.changed() => {
					break;
				}
			}
		}
		tracing::info!(worker_id = %self.worker_id, "Delivery worker stopped");
	}

	/// Executes one worker cycle; at most one runs per instance.
	#[instrument(skip_all, fields(worker_id = %self.worker_id))]
	pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport, EngineError> {
		if self
			.cycle_running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Ok(CycleReport {
				skipped_reentry: true,
				..CycleReport::default()
			});
		}
		let result = self.cycle_inner().await;
		self.cycle_running.store(false, Ordering::Release);
		result
	}

	async fn cycle_inner(self: &Arc<Self>) -> Result<CycleReport, EngineError> {
		let now = Utc::now();
		let orphan_cutoff = now
			- ChronoDuration::from_std(self.options.orphan_threshold)
				.unwrap_or_else(|_| ChronoDuration::seconds(120));

		self.router.purge_sessions();

		// Converge orders whose remains already hit zero, e.g. after a crash
		// between the last progress update and finalization.
		for order_id in self.store.orders_ready_to_finalize().await? {
			if let Some(order) = self.store.finalize_order_if_complete(order_id, now).await? {
				tracing::info!(
					order_id = %truncate_id(&order.id.to_string()),
					"Order converged to COMPLETED"
				);
			}
		}

		let due = self
			.store
			.due_tasks(now, orphan_cutoff, self.options.batch_size)
			.await?;
		let mut report = CycleReport {
			due: due.len(),
			..CycleReport::default()
		};
		if due.is_empty() {
			return Ok(report);
		}

		let mut handles = Vec::with_capacity(due.len());
		for task in due {
			let permit = match Arc::clone(&self.concurrency).acquire_owned().await {
				Ok(permit) => permit,
				Err(_) => break,
			};
			let worker = Arc::clone(self);
			handles.push(tokio::spawn(async move {
				let dispatched = worker.process_task(task, orphan_cutoff, now).await;
				drop(permit);
				dispatched
			}));
		}
		for handle in handles {
			match handle.await {
				Ok(dispatched) => {
					if dispatched {
						report.dispatched += 1;
					}
				}
				Err(e) => {
					tracing::error!(worker_id = %self.worker_id, error = %e, "Task worker panicked");
				}
			}
		}
		Ok(report)
	}

	/// Claims and executes one due task; returns whether the claim was won.
	async fn process_task(
		&self,
		task: Task,
		orphan_cutoff: DateTime<Utc>,
		now: DateTime<Utc>,
	) -> bool {
		let expected = task.status;
		let claimed = match self
			.store
			.claim_task(task.id, expected, orphan_cutoff, &self.worker_id, now)
			.await
		{
			Ok(ClaimOutcome::Claimed(claimed)) => claimed,
			Ok(ClaimOutcome::Lost) => {
				// Another worker won the race; silently a no-op.
				self.stats.claims_lost.fetch_add(1, Ordering::Relaxed);
				return false;
			}
			Err(e) => {
				tracing::error!(
					task_id = %truncate_id(&task.id.to_string()),
					error = %e,
					"Claim failed, task halted for this cycle"
				);
				return false;
			}
		};

		if expected == TaskStatus::Executing {
			self.stats.recovered_orphans.fetch_add(1, Ordering::Relaxed);
			tracing::warn!(
				task_id = %truncate_id(&claimed.id.to_string()),
				attempts = claimed.attempts,
				"Recovered orphaned task"
			);
		}
		if expected == TaskStatus::FailedRetrying {
			self.stats.retries.fetch_add(1, Ordering::Relaxed);
		}
		self.stats.processed.fetch_add(1, Ordering::Relaxed);

		if let Err(e) = self.execute_claimed(&claimed).await {
			tracing::error!(
				task_id = %truncate_id(&claimed.id.to_string()),
				error = %e,
				"Task halted after store error; orphan recovery will reclaim it"
			);
		}
		true
	}

	/// Routes and executes one claimed task, then retires it.
	async fn execute_claimed(&self, task: &Task) -> Result<(), EngineError> {
		let order = self.store.get_order(task.order_id).await?;

		let route = RouteRequest {
			operation: Operation::PlayDelivery,
			country: None,
			quantity: task.quantity,
			session_id: None,
		};
		let lease = match self.router.select(&route).await {
			Ok(lease) => lease,
			Err(e) => {
				tracing::error!(
					task_id = %truncate_id(&task.id.to_string()),
					error = %e,
					"Router error, treating as transient"
				);
				None
			}
		};
		let Some(lease) = lease else {
			return self.handle_failure(task, "no proxy available").await;
		};

		let node_id = lease.node.id;
		let tier = lease.node.tier;
		if let Err(e) = self.store.set_task_proxy(task.id, node_id).await {
			tracing::warn!(
				task_id = %truncate_id(&task.id.to_string()),
				error = %e,
				"Failed to record proxy route"
			);
		}

		let request = ExecutionRequest {
			task_id: task.id,
			order_id: task.order_id,
			quantity: task.quantity,
			target_url: order.target_url.clone(),
			proxy: lease.handle(),
		};
		let result = self.executor.execute(&request).await;
		if let Err(e) = self.router.release(node_id).await {
			tracing::warn!(node_id = %node_id, error = %e, "Failed to release proxy lease");
		}

		match result {
			Ok(response) if response.success => {
				self.router
					.report_result(node_id, tier, true, Some(response.latency_ms), None)
					.await
					.ok();
				self.handle_success(task).await
			}
			Ok(response) => {
				self.router
					.report_result(
						node_id,
						tier,
						false,
						Some(response.latency_ms),
						response.error_code,
					)
					.await
					.ok();
				let reason = response
					.message
					.unwrap_or_else(|| format!("executor error {}", response.error_code.unwrap_or(0)));
				self.handle_failure(task, &reason).await
			}
			Err(e) => {
				self.router
					.report_result(node_id, tier, false, None, None)
					.await
					.ok();
				self.handle_failure(task, &e.to_string()).await
			}
		}
	}

	/// Retires a successful task and advances its order.
	async fn handle_success(&self, task: &Task) -> Result<(), EngineError> {
		let now = Utc::now();
		let progress = with_store_retry(|| {
			self.store.complete_task(task.id, task.order_id, task.quantity, now)
		})
		.await?;
		self.stats.completed.fetch_add(1, Ordering::Relaxed);
		tracing::debug!(
			task_id = %truncate_id(&task.id.to_string()),
			delivered = progress.delivered,
			remains = progress.remains,
			"Task completed"
		);
		self.finalize_if_done(&progress).await
	}

	/// Retires a failed attempt: backoff while the retry budget lasts,
	/// permanent failure plus refund once it is exhausted.
	async fn handle_failure(&self, task: &Task, reason: &str) -> Result<(), EngineError> {
		if task.attempts < task.max_attempts {
			self.stats.failed_transient.fetch_add(1, Ordering::Relaxed);
			let retry_after = Utc::now() + retry_backoff(task.attempts);
			with_store_retry(|| self.store.fail_task_retrying(task.id, retry_after, reason))
				.await?;
			tracing::debug!(
				task_id = %truncate_id(&task.id.to_string()),
				attempts = task.attempts,
				reason,
				"Task failed, retrying"
			);
			return Ok(());
		}

		self.stats.failed_permanent.fetch_add(1, Ordering::Relaxed);
		let progress = with_store_retry(|| {
			self.store
				.fail_task_permanent(task.id, task.order_id, task.quantity, reason)
		})
		.await?;
		tracing::warn!(
			task_id = %truncate_id(&task.id.to_string()),
			attempts = task.attempts,
			reason,
			"Task failed permanently"
		);

		// Refund errors abort only the refund; the task stays
		// FAILED_PERMANENT with refunded = false for reconciliation.
		if let Err(e) = self.ledger.refund_task(task).await {
			tracing::error!(
				task_id = %truncate_id(&task.id.to_string()),
				error = %e,
				"Refund failed; reconciliation will surface the gap"
			);
		}

		self.finalize_if_done(&progress).await
	}

	async fn finalize_if_done(&self, progress: &OrderProgress) -> Result<(), EngineError> {
		if !progress.is_fully_accounted() {
			return Ok(());
		}
		if let Some(order) = self
			.store
			.finalize_order_if_complete(progress.order_id, Utc::now())
			.await?
		{
			tracing::info!(
				order_id = %truncate_id(&order.id.to_string()),
				notes = order.notes.as_deref().unwrap_or(""),
				"Order completed"
			);
		}
		Ok(())
	}
}

/// Hostname-derived worker id with a random suffix, stable for the life of
/// the instance.
fn derive_worker_id(prefix: &str) -> String {
	let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
	let suffix = Uuid::new_v4().simple().to_string();
	format!("{prefix}-{host}-{}", &suffix[..8])
}

/// Retries a store write a couple of times before giving up on the task for
/// this cycle.
async fn with_store_retry<T, Fut, F>(mut op: F) -> Result<T, StoreError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, StoreError>>,
{
	let mut delay = Duration::from_millis(50);
	for _ in 0..2 {
		match op().await {
			Ok(value) => return Ok(value),
			Err(e) => {
				tracing::warn!(error = %e, "Store write failed, retrying");
				tokio::time::sleep(delay).await;
				delay *= 2;
			}
		}
	}
	op().await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_and_caps_at_eight_times_base() {
		assert_eq!(retry_backoff(1), ChronoDuration::seconds(30));
		assert_eq!(retry_backoff(2), ChronoDuration::seconds(60));
		assert_eq!(retry_backoff(3), ChronoDuration::seconds(120));
		assert_eq!(retry_backoff(4), ChronoDuration::seconds(240));
		// Capped from here on.
		assert_eq!(retry_backoff(5), ChronoDuration::seconds(480));
		assert_eq!(retry_backoff(6), ChronoDuration::seconds(480));
		assert_eq!(retry_backoff(40), ChronoDuration::seconds(480));
		// Zero attempts behaves like the first.
		assert_eq!(retry_backoff(0), ChronoDuration::seconds(30));
	}

	#[test]
	fn worker_ids_carry_prefix_and_unique_suffix() {
		let a = derive_worker_id("playflow");
		let b = derive_worker_id("playflow");
		assert!(a.starts_with("playflow-"));
		assert_ne!(a, b);
	}
}
