//! Durable store for the playflow delivery engine.
//!
//! This module provides the persistence seam for orders, tasks, the balance
//! ledger, refund bookkeeping, and proxy nodes. Every state change is
//! expressed as an atomic conditional operation: claims, progress counters,
//! and refund flags are compare-and-set updates, never read-modify-write at
//! the application layer. Losing a conditional update is a typed no-op
//! result, not an error, so concurrent workers race safely.
//!
//! Two backends are provided: an in-memory store for tests and development,
//! and a SQLite store where each conditional operation is the literal
//! `UPDATE ... WHERE` statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playflow_types::{
	AnomalyKind, FlaggedUser, LedgerEntry, Order, OrderStatus, ProxyNode, ProxyNodeStatus,
	ProxyTier, RefundAnomaly, RefundEvent, Task, TaskStatus,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
	pub mod sqlite;
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
	/// A referenced row does not exist.
	#[error("Not found")]
	NotFound,
	/// The debit guard rejected an order because the user's balance would go
	/// negative.
	#[error("Insufficient balance")]
	InsufficientBalance,
	/// Error raised by the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
}

impl From<rusqlite::Error> for StoreError {
	fn from(err: rusqlite::Error) -> Self {
		match err {
			rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
			other => StoreError::Backend(other.to_string()),
		}
	}
}

/// Result of creating an order.
#[derive(Debug, Clone)]
pub enum CreateOrderOutcome {
	/// The order and its task batch were written and the user was debited.
	Created(Order),
	/// An order with the same `(user_id, external_key)` already existed; no
	/// new rows were written and the user was not debited again.
	Existing(Order),
}

impl CreateOrderOutcome {
	pub fn order(&self) -> &Order {
		match self {
			CreateOrderOutcome::Created(order) | CreateOrderOutcome::Existing(order) => order,
		}
	}
}

/// Result of planning tasks for an already-created order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
	/// The whole batch was inserted.
	Inserted,
	/// The order already carries tasks with these idempotency tokens; nothing
	/// was written.
	AlreadyPlanned,
}

/// Result of an atomic task claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
	/// This worker won the claim; the returned task carries the new stamps.
	Claimed(Task),
	/// Another worker won the race, or the task left the expected status.
	Lost,
}

/// Result of the conditional refund operation.
#[derive(Debug, Clone)]
pub enum RefundOutcome {
	/// The task's `refunded` flag flipped and the user was credited.
	Applied(LedgerEntry),
	/// The flag flipped but refunds are disabled; only bookkeeping changed.
	BookkeepingOnly,
	/// The flag was already set; nothing changed.
	AlreadyRefunded,
}

/// Post-update order aggregates returned by progress mutations, so callers
/// can check for completion without a second read.
#[derive(Debug, Clone)]
pub struct OrderProgress {
	pub order_id: Uuid,
	pub quantity: u64,
	pub delivered: u64,
	pub failed_permanent: u64,
	pub remains: u64,
	pub refund_amount: Decimal,
	pub status: OrderStatus,
}

impl OrderProgress {
	/// Whether every unit has been accounted for.
	pub fn is_fully_accounted(&self) -> bool {
		self.remains == 0
	}
}

/// Shared handle to a store backend.
pub type Store = Arc<dyn StoreInterface>;

/// Trait defining the interface for durable store backends.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers: methods documented as conditional updates must apply their
/// status/flag predicate and their mutation as one indivisible step.
#[async_trait]
pub trait StoreInterface: Send + Sync {
	// ----- users -----

	/// Creates or replaces a user balance row.
	async fn upsert_user(&self, user_id: Uuid, balance: Decimal) -> Result<(), StoreError>;

	/// Current balance for a user.
	async fn user_balance(&self, user_id: Uuid) -> Result<Decimal, StoreError>;

	/// Unconditionally credits a user and appends a CREDIT ledger row.
	async fn credit_user(
		&self,
		user_id: Uuid,
		amount: Decimal,
		reason: &str,
	) -> Result<LedgerEntry, StoreError>;

	// ----- orders -----

	/// Writes an order, its initial task batch, the balance debit, and the
	/// DEBIT ledger row in one transaction.
	///
	/// The debit is a conditional decrement guarded by `balance >= total_cost`;
	/// a guard miss rejects the order with [`StoreError::InsufficientBalance`]
	/// and writes nothing. A duplicate `(user_id, external_key)` returns the
	/// existing order without writing or debiting.
	async fn create_order_with_tasks(
		&self,
		order: &Order,
		tasks: &[Task],
	) -> Result<CreateOrderOutcome, StoreError>;

	async fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError>;

	/// All orders; used by the invariant validator's scan.
	async fn all_orders(&self) -> Result<Vec<Order>, StoreError>;

	/// Terminal orders with refund activity (a non-zero refund total or at
	/// least one refunded task); the reconciliation working set.
	async fn terminal_orders_with_refund_activity(&self) -> Result<Vec<Order>, StoreError>;

	/// Non-terminal orders whose `remains` already reached zero, e.g. after a
	/// crash between the last progress update and finalization.
	async fn orders_ready_to_finalize(&self) -> Result<Vec<Uuid>, StoreError>;

	/// Marks the order COMPLETED if `remains == 0` and the status is not yet
	/// terminal, stamping `completed_at` and the summary notes. Returns the
	/// updated order when the transition happened.
	async fn finalize_order_if_complete(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Option<Order>, StoreError>;

	/// Instant-completion path for orders below the task threshold: marks
	/// everything delivered and the order COMPLETED in one step.
	async fn complete_order_instantly(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError>;

	/// Marks the order CANCELLED, stamping `completed_at` and notes. The
	/// caller is responsible for having abandoned the order's tasks first.
	async fn set_order_cancelled(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError>;

	// ----- tasks -----

	/// Inserts a planned task batch for an existing order, all-or-nothing.
	///
	/// Re-planning is a no-op: if any task with one of these idempotency
	/// tokens already exists for the order, nothing is written.
	async fn insert_tasks(&self, order_id: Uuid, tasks: &[Task]) -> Result<PlanOutcome, StoreError>;

	async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

	async fn tasks_for_order(&self, order_id: Uuid) -> Result<Vec<Task>, StoreError>;

	/// Tasks the worker may process now: PENDING past their schedule,
	/// FAILED_RETRYING past their backoff, or EXECUTING past the orphan
	/// cutoff. Ordered by schedule, limited to `batch`.
	async fn due_tasks(
		&self,
		now: DateTime<Utc>,
		orphan_cutoff: DateTime<Utc>,
		batch: usize,
	) -> Result<Vec<Task>, StoreError>;

	/// Atomically claims a task for execution.
	///
	/// The single conditional update moves the task from `expected_status` to
	/// EXECUTING iff the status still matches and `execution_started_at` is
	/// either unset or older than `orphan_cutoff`, stamping
	/// `execution_started_at = now` and `worker_id` and incrementing
	/// `attempts`. A zero-row update reports [`ClaimOutcome::Lost`].
	async fn claim_task(
		&self,
		task_id: Uuid,
		expected_status: TaskStatus,
		orphan_cutoff: DateTime<Utc>,
		worker_id: &str,
		now: DateTime<Utc>,
	) -> Result<ClaimOutcome, StoreError>;

	/// Records the proxy node a claimed task routed through.
	async fn set_task_proxy(&self, task_id: Uuid, node_id: Uuid) -> Result<(), StoreError>;

	/// Completes a task and advances its order in one transaction: the task
	/// moves to COMPLETED, and the order gets `delivered += quantity` with
	/// `remains` clamp-decremented.
	async fn complete_task(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		now: DateTime<Utc>,
	) -> Result<OrderProgress, StoreError>;

	/// Parks a task in FAILED_RETRYING with its backoff deadline.
	async fn fail_task_retrying(
		&self,
		task_id: Uuid,
		retry_after: DateTime<Utc>,
		error: &str,
	) -> Result<(), StoreError>;

	/// Permanently abandons a task and advances its order in one transaction:
	/// the task moves to FAILED_PERMANENT, and the order gets
	/// `failed_permanent += quantity` with `remains` clamp-decremented.
	async fn fail_task_permanent(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		error: &str,
	) -> Result<OrderProgress, StoreError>;

	/// Moves every non-terminal task of an order to FAILED_PERMANENT and
	/// applies the corresponding order counter bumps, returning the abandoned
	/// tasks so the caller can refund them.
	async fn abandon_open_tasks(
		&self,
		order_id: Uuid,
		error: &str,
	) -> Result<Vec<Task>, StoreError>;

	/// Number of EXECUTING tasks whose claim stamp is older than `cutoff`;
	/// the admin orphan probe.
	async fn executing_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

	// ----- refunds & ledger -----

	/// Applies the exactly-once refund for a permanently failed task.
	///
	/// Step one is the conditional flip `refunded = false -> true`; a
	/// zero-row update reports [`RefundOutcome::AlreadyRefunded`] and nothing
	/// else runs. When `credit` is set, the same transaction credits the
	/// user, appends the REFUND ledger row, bumps the order's refund total,
	/// and appends a refund event.
	async fn apply_refund(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		user_id: Uuid,
		amount: Decimal,
		credit: bool,
		now: DateTime<Utc>,
	) -> Result<RefundOutcome, StoreError>;

	async fn ledger_entries_for_order(&self, order_id: Uuid)
		-> Result<Vec<LedgerEntry>, StoreError>;

	/// Refund events at or after `since`, for velocity analysis.
	async fn refund_events_since(
		&self,
		since: DateTime<Utc>,
	) -> Result<Vec<RefundEvent>, StoreError>;

	// ----- anomalies & flags -----

	async fn record_anomaly(&self, anomaly: &RefundAnomaly) -> Result<(), StoreError>;

	/// Whether an unresolved anomaly of this kind is already open for the
	/// order; reconciliation uses this to avoid duplicates.
	async fn open_anomaly_exists(
		&self,
		order_id: Uuid,
		kind: AnomalyKind,
	) -> Result<bool, StoreError>;

	async fn open_anomalies(&self) -> Result<Vec<RefundAnomaly>, StoreError>;

	/// Records (or refreshes) a high-refund-velocity flag for a user.
	async fn flag_user(&self, flagged: &FlaggedUser) -> Result<(), StoreError>;

	async fn flagged_users(&self) -> Result<Vec<FlaggedUser>, StoreError>;

	// ----- proxy nodes -----

	async fn insert_node(&self, node: &ProxyNode) -> Result<(), StoreError>;

	async fn get_node(&self, node_id: Uuid) -> Result<ProxyNode, StoreError>;

	/// ONLINE nodes with spare capacity in a tier, optionally filtered by
	/// country, up to `limit`.
	async fn list_candidates(
		&self,
		tier: ProxyTier,
		country: Option<&str>,
		limit: usize,
	) -> Result<Vec<ProxyNode>, StoreError>;

	/// Conditionally increments `current_load` while it is below capacity.
	/// Returns false when the node was already full (or not leasable).
	async fn lease_node(&self, node_id: Uuid) -> Result<bool, StoreError>;

	/// Decrements `current_load`, clamped at zero.
	async fn release_node(&self, node_id: Uuid) -> Result<(), StoreError>;

	async fn set_node_status(
		&self,
		node_id: Uuid,
		status: ProxyNodeStatus,
	) -> Result<(), StoreError>;

	async fn all_nodes(&self) -> Result<Vec<ProxyNode>, StoreError>;
}
