//! In-memory store backend.
//!
//! This implementation keeps all tables in maps behind a single read-write
//! lock, so every conditional operation from the trait runs atomically while
//! the write guard is held. It provides no persistence across restarts and is
//! used by tests and development setups.

use crate::{
	ClaimOutcome, CreateOrderOutcome, OrderProgress, PlanOutcome, RefundOutcome, StoreError,
	StoreInterface,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playflow_types::{
	AnomalyKind, FlaggedUser, LedgerEntry, LedgerEntryKind, Order, OrderStatus, ProxyNode,
	ProxyNodeStatus, ProxyTier, RefundAnomaly, RefundEvent, Task, TaskStatus,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
	users: HashMap<Uuid, Decimal>,
	orders: HashMap<Uuid, Order>,
	/// (user_id, external_key) -> order id, backing the idempotency unique key.
	external_keys: HashMap<(Uuid, String), Uuid>,
	tasks: HashMap<Uuid, Task>,
	ledger: Vec<LedgerEntry>,
	refund_events: Vec<RefundEvent>,
	anomalies: Vec<RefundAnomaly>,
	flagged_users: HashMap<Uuid, FlaggedUser>,
	nodes: HashMap<Uuid, ProxyNode>,
}

impl Inner {
	fn order_progress(&self, order_id: Uuid) -> Result<OrderProgress, StoreError> {
		let order = self.orders.get(&order_id).ok_or(StoreError::NotFound)?;
		Ok(OrderProgress {
			order_id,
			quantity: order.quantity,
			delivered: order.delivered,
			failed_permanent: order.failed_permanent,
			remains: order.remains,
			refund_amount: order.refund_amount,
			status: order.status,
		})
	}

	fn append_ledger(
		&mut self,
		user_id: Uuid,
		order_id: Option<Uuid>,
		task_id: Option<Uuid>,
		amount: Decimal,
		balance_before: Decimal,
		balance_after: Decimal,
		kind: LedgerEntryKind,
		reason: String,
		at: DateTime<Utc>,
	) -> LedgerEntry {
		let entry = LedgerEntry {
			id: Uuid::new_v4(),
			user_id,
			order_id,
			task_id,
			amount,
			balance_before,
			balance_after,
			kind,
			reason,
			at,
		};
		self.ledger.push(entry.clone());
		entry
	}
}

/// In-memory store implementation.
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StoreInterface for MemoryStore {
	async fn upsert_user(&self, user_id: Uuid, balance: Decimal) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		inner.users.insert(user_id, balance);
		Ok(())
	}

	async fn user_balance(&self, user_id: Uuid) -> Result<Decimal, StoreError> {
		let inner = self.inner.read().await;
		inner.users.get(&user_id).copied().ok_or(StoreError::NotFound)
	}

	async fn credit_user(
		&self,
		user_id: Uuid,
		amount: Decimal,
		reason: &str,
	) -> Result<LedgerEntry, StoreError> {
		let mut inner = self.inner.write().await;
		let balance = inner.users.get(&user_id).copied().ok_or(StoreError::NotFound)?;
		let after = balance + amount;
		inner.users.insert(user_id, after);
		Ok(inner.append_ledger(
			user_id,
			None,
			None,
			amount,
			balance,
			after,
			LedgerEntryKind::Credit,
			reason.to_string(),
			Utc::now(),
		))
	}

	async fn create_order_with_tasks(
		&self,
		order: &Order,
		tasks: &[Task],
	) -> Result<CreateOrderOutcome, StoreError> {
		let mut inner = self.inner.write().await;

		// Idempotency collision returns the existing order, no error.
		if let Some(key) = &order.external_key {
			if let Some(existing_id) = inner.external_keys.get(&(order.user_id, key.clone())) {
				let existing = inner.orders.get(existing_id).ok_or(StoreError::NotFound)?;
				return Ok(CreateOrderOutcome::Existing(existing.clone()));
			}
		}

		// Conditional debit: balance must cover the full cost.
		let balance = inner
			.users
			.get(&order.user_id)
			.copied()
			.ok_or(StoreError::NotFound)?;
		if balance < order.total_cost {
			return Err(StoreError::InsufficientBalance);
		}
		let after = balance - order.total_cost;
		inner.users.insert(order.user_id, after);
		inner.append_ledger(
			order.user_id,
			Some(order.id),
			None,
			-order.total_cost,
			balance,
			after,
			LedgerEntryKind::Debit,
			format!("Debit for order {}", order.id),
			order.created_at,
		);

		inner.orders.insert(order.id, order.clone());
		if let Some(key) = &order.external_key {
			inner
				.external_keys
				.insert((order.user_id, key.clone()), order.id);
		}
		for task in tasks {
			inner.tasks.insert(task.id, task.clone());
		}

		Ok(CreateOrderOutcome::Created(order.clone()))
	}

	async fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
		let inner = self.inner.read().await;
		inner.orders.get(&order_id).cloned().ok_or(StoreError::NotFound)
	}

	async fn all_orders(&self) -> Result<Vec<Order>, StoreError> {
		let inner = self.inner.read().await;
		let mut orders: Vec<Order> = inner.orders.values().cloned().collect();
		orders.sort_by_key(|o| o.created_at);
		Ok(orders)
	}

	async fn terminal_orders_with_refund_activity(&self) -> Result<Vec<Order>, StoreError> {
		let inner = self.inner.read().await;
		let orders = inner
			.orders
			.values()
			.filter(|order| {
				order.status.is_terminal()
					&& (order.refund_amount > Decimal::ZERO
						|| inner
							.tasks
							.values()
							.any(|t| t.order_id == order.id && t.refunded))
			})
			.cloned()
			.collect();
		Ok(orders)
	}

	async fn orders_ready_to_finalize(&self) -> Result<Vec<Uuid>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.orders
			.values()
			.filter(|o| !o.status.is_terminal() && o.remains == 0)
			.map(|o| o.id)
			.collect())
	}

	async fn finalize_order_if_complete(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Option<Order>, StoreError> {
		let mut inner = self.inner.write().await;
		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		if order.status.is_terminal() || order.remains != 0 {
			return Ok(None);
		}
		order.status = OrderStatus::Completed;
		order.completed_at = Some(now);
		order.notes = Some(order.completion_notes());
		Ok(Some(order.clone()))
	}

	async fn complete_order_instantly(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError> {
		let mut inner = self.inner.write().await;
		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		order.delivered = order.quantity;
		order.remains = 0;
		order.status = OrderStatus::Completed;
		order.started_at.get_or_insert(now);
		order.completed_at = Some(now);
		order.notes = Some(order.completion_notes());
		Ok(order.clone())
	}

	async fn set_order_cancelled(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError> {
		let mut inner = self.inner.write().await;
		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		order.status = OrderStatus::Cancelled;
		order.completed_at = Some(now);
		order.notes = Some(order.completion_notes());
		Ok(order.clone())
	}

	async fn insert_tasks(&self, order_id: Uuid, tasks: &[Task]) -> Result<PlanOutcome, StoreError> {
		let mut inner = self.inner.write().await;
		if !inner.orders.contains_key(&order_id) {
			return Err(StoreError::NotFound);
		}
		let already_planned = inner.tasks.values().any(|existing| {
			existing.order_id == order_id
				&& tasks
					.iter()
					.any(|t| t.idempotency_token == existing.idempotency_token)
		});
		if already_planned {
			return Ok(PlanOutcome::AlreadyPlanned);
		}
		for task in tasks {
			inner.tasks.insert(task.id, task.clone());
		}
		Ok(PlanOutcome::Inserted)
	}

	async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
		let inner = self.inner.read().await;
		inner.tasks.get(&task_id).cloned().ok_or(StoreError::NotFound)
	}

	async fn tasks_for_order(&self, order_id: Uuid) -> Result<Vec<Task>, StoreError> {
		let inner = self.inner.read().await;
		let mut tasks: Vec<Task> = inner
			.tasks
			.values()
			.filter(|t| t.order_id == order_id)
			.cloned()
			.collect();
		tasks.sort_by_key(|t| t.sequence_number);
		Ok(tasks)
	}

	async fn due_tasks(
		&self,
		now: DateTime<Utc>,
		orphan_cutoff: DateTime<Utc>,
		batch: usize,
	) -> Result<Vec<Task>, StoreError> {
		let inner = self.inner.read().await;
		let mut due: Vec<Task> = inner
			.tasks
			.values()
			.filter(|t| match t.status {
				TaskStatus::Pending => t.scheduled_at <= now,
				TaskStatus::FailedRetrying => t.retry_after.is_some_and(|at| at <= now),
				TaskStatus::Executing => {
					t.execution_started_at.is_some_and(|at| at <= orphan_cutoff)
				}
				_ => false,
			})
			.cloned()
			.collect();
		due.sort_by_key(|t| t.scheduled_at);
		due.truncate(batch);
		Ok(due)
	}

	async fn claim_task(
		&self,
		task_id: Uuid,
		expected_status: TaskStatus,
		orphan_cutoff: DateTime<Utc>,
		worker_id: &str,
		now: DateTime<Utc>,
	) -> Result<ClaimOutcome, StoreError> {
		let mut inner = self.inner.write().await;
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;

		let claimable = task.status == expected_status
			&& task
				.execution_started_at
				.is_none_or(|started| started <= orphan_cutoff);
		if !claimable {
			return Ok(ClaimOutcome::Lost);
		}

		task.status = TaskStatus::Executing;
		task.execution_started_at = Some(now);
		task.worker_id = Some(worker_id.to_string());
		task.attempts += 1;
		Ok(ClaimOutcome::Claimed(task.clone()))
	}

	async fn set_task_proxy(&self, task_id: Uuid, node_id: Uuid) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
		task.proxy_node_id = Some(node_id);
		Ok(())
	}

	async fn complete_task(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		now: DateTime<Utc>,
	) -> Result<OrderProgress, StoreError> {
		let mut inner = self.inner.write().await;
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
		// Conditional on EXECUTING: a stale worker whose claim was taken over
		// must not double-count the slice.
		if task.status != TaskStatus::Executing {
			return inner.order_progress(order_id);
		}
		task.status = TaskStatus::Completed;
		task.completed_at = Some(now);

		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		order.delivered += quantity;
		order.remains = order.remains.saturating_sub(quantity);
		inner.order_progress(order_id)
	}

	async fn fail_task_retrying(
		&self,
		task_id: Uuid,
		retry_after: DateTime<Utc>,
		error: &str,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
		if task.status != TaskStatus::Executing {
			return Ok(());
		}
		task.status = TaskStatus::FailedRetrying;
		task.retry_after = Some(retry_after);
		task.error_message = Some(Task::truncate_error(error));
		Ok(())
	}

	async fn fail_task_permanent(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		error: &str,
	) -> Result<OrderProgress, StoreError> {
		let mut inner = self.inner.write().await;
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
		if task.status != TaskStatus::Executing {
			return inner.order_progress(order_id);
		}
		task.status = TaskStatus::FailedPermanent;
		task.error_message = Some(Task::truncate_error(error));

		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		order.failed_permanent += quantity;
		order.remains = order.remains.saturating_sub(quantity);
		inner.order_progress(order_id)
	}

	async fn abandon_open_tasks(
		&self,
		order_id: Uuid,
		error: &str,
	) -> Result<Vec<Task>, StoreError> {
		let mut inner = self.inner.write().await;
		let open_ids: Vec<Uuid> = inner
			.tasks
			.values()
			.filter(|t| t.order_id == order_id && !t.status.is_terminal())
			.map(|t| t.id)
			.collect();

		let mut abandoned = Vec::with_capacity(open_ids.len());
		for task_id in open_ids {
			let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
			task.status = TaskStatus::FailedPermanent;
			task.error_message = Some(Task::truncate_error(error));
			let quantity = task.quantity;
			let snapshot = task.clone();
			let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
			order.failed_permanent += quantity;
			order.remains = order.remains.saturating_sub(quantity);
			abandoned.push(snapshot);
		}
		abandoned.sort_by_key(|t| t.sequence_number);
		Ok(abandoned)
	}

	async fn executing_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.tasks
			.values()
			.filter(|t| {
				t.status == TaskStatus::Executing
					&& t.execution_started_at.is_some_and(|at| at <= cutoff)
			})
			.count() as u64)
	}

	async fn apply_refund(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		user_id: Uuid,
		amount: Decimal,
		credit: bool,
		now: DateTime<Utc>,
	) -> Result<RefundOutcome, StoreError> {
		let mut inner = self.inner.write().await;

		// Step one: the conditional flip that makes the whole path
		// exactly-once.
		let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound)?;
		if task.refunded {
			return Ok(RefundOutcome::AlreadyRefunded);
		}
		task.refunded = true;

		if !credit {
			return Ok(RefundOutcome::BookkeepingOnly);
		}

		let balance = inner.users.get(&user_id).copied().ok_or(StoreError::NotFound)?;
		let after = balance + amount;
		inner.users.insert(user_id, after);
		let entry = inner.append_ledger(
			user_id,
			Some(order_id),
			Some(task_id),
			amount,
			balance,
			after,
			LedgerEntryKind::Refund,
			format!("Refund for failed task {task_id}"),
			now,
		);

		let order = inner.orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;
		order.refund_amount += amount;

		inner.refund_events.push(RefundEvent {
			id: Uuid::new_v4(),
			user_id,
			order_id,
			task_id,
			amount,
			at: now,
		});

		Ok(RefundOutcome::Applied(entry))
	}

	async fn ledger_entries_for_order(
		&self,
		order_id: Uuid,
	) -> Result<Vec<LedgerEntry>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.ledger
			.iter()
			.filter(|e| e.order_id == Some(order_id))
			.cloned()
			.collect())
	}

	async fn refund_events_since(
		&self,
		since: DateTime<Utc>,
	) -> Result<Vec<RefundEvent>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.refund_events
			.iter()
			.filter(|e| e.at >= since)
			.cloned()
			.collect())
	}

	async fn record_anomaly(&self, anomaly: &RefundAnomaly) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		inner.anomalies.push(anomaly.clone());
		Ok(())
	}

	async fn open_anomaly_exists(
		&self,
		order_id: Uuid,
		kind: AnomalyKind,
	) -> Result<bool, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner
			.anomalies
			.iter()
			.any(|a| a.order_id == order_id && a.kind == kind && a.is_open()))
	}

	async fn open_anomalies(&self) -> Result<Vec<RefundAnomaly>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner.anomalies.iter().filter(|a| a.is_open()).cloned().collect())
	}

	async fn flag_user(&self, flagged: &FlaggedUser) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		inner.flagged_users.insert(flagged.user_id, flagged.clone());
		Ok(())
	}

	async fn flagged_users(&self) -> Result<Vec<FlaggedUser>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner.flagged_users.values().cloned().collect())
	}

	async fn insert_node(&self, node: &ProxyNode) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		inner.nodes.insert(node.id, node.clone());
		Ok(())
	}

	async fn get_node(&self, node_id: Uuid) -> Result<ProxyNode, StoreError> {
		let inner = self.inner.read().await;
		inner.nodes.get(&node_id).cloned().ok_or(StoreError::NotFound)
	}

	async fn list_candidates(
		&self,
		tier: ProxyTier,
		country: Option<&str>,
		limit: usize,
	) -> Result<Vec<ProxyNode>, StoreError> {
		let inner = self.inner.read().await;
		let mut candidates: Vec<ProxyNode> = inner
			.nodes
			.values()
			.filter(|n| {
				n.status == ProxyNodeStatus::Online
					&& n.has_capacity()
					&& n.tier == tier
					&& country.is_none_or(|c| n.country.as_deref() == Some(c))
			})
			.cloned()
			.collect();
		candidates.sort_by_key(|n| n.id);
		candidates.truncate(limit);
		Ok(candidates)
	}

	async fn lease_node(&self, node_id: Uuid) -> Result<bool, StoreError> {
		let mut inner = self.inner.write().await;
		let node = inner.nodes.get_mut(&node_id).ok_or(StoreError::NotFound)?;
		if node.status != ProxyNodeStatus::Online || !node.has_capacity() {
			return Ok(false);
		}
		node.current_load += 1;
		Ok(true)
	}

	async fn release_node(&self, node_id: Uuid) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		let node = inner.nodes.get_mut(&node_id).ok_or(StoreError::NotFound)?;
		node.current_load = node.current_load.saturating_sub(1);
		Ok(())
	}

	async fn set_node_status(
		&self,
		node_id: Uuid,
		status: ProxyNodeStatus,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.write().await;
		let node = inner.nodes.get_mut(&node_id).ok_or(StoreError::NotFound)?;
		node.status = status;
		Ok(())
	}

	async fn all_nodes(&self) -> Result<Vec<ProxyNode>, StoreError> {
		let inner = self.inner.read().await;
		Ok(inner.nodes.values().cloned().collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;
	use rust_decimal_macros::dec;

	fn order_with_tasks(quantity: u64, task_quantities: &[u64]) -> (Order, Vec<Task>) {
		let user_id = Uuid::new_v4();
		let order =
			Order::new(user_id, "https://example.com/track", quantity, dec!(0.0002), None).unwrap();
		let now = Utc::now();
		let tasks = task_quantities
			.iter()
			.enumerate()
			.map(|(i, &q)| Task {
				id: Uuid::new_v4(),
				order_id: order.id,
				sequence_number: i as u32,
				quantity: q,
				scheduled_at: now,
				status: TaskStatus::Pending,
				attempts: 0,
				max_attempts: 3,
				retry_after: None,
				execution_started_at: None,
				worker_id: None,
				proxy_node_id: None,
				idempotency_token: format!("token-{i}"),
				refunded: false,
				error_message: None,
				completed_at: None,
			})
			.collect();
		(order, tasks)
	}

	async fn seeded_store(order: &Order, tasks: &[Task]) -> MemoryStore {
		let store = MemoryStore::new();
		store.upsert_user(order.user_id, dec!(100)).await.unwrap();
		store.create_order_with_tasks(order, tasks).await.unwrap();
		store
	}

	#[tokio::test]
	async fn debit_is_conditional_on_balance() {
		let (order, tasks) = order_with_tasks(1000, &[500, 500]);
		let store = MemoryStore::new();
		store.upsert_user(order.user_id, dec!(0.1)).await.unwrap();

		let result = store.create_order_with_tasks(&order, &tasks).await;
		assert!(matches!(result, Err(StoreError::InsufficientBalance)));
		// Nothing was written.
		assert!(matches!(store.get_order(order.id).await, Err(StoreError::NotFound)));
		assert_eq!(store.user_balance(order.user_id).await.unwrap(), dec!(0.1));
	}

	#[tokio::test]
	async fn duplicate_external_key_returns_existing_without_debit() {
		let user_id = Uuid::new_v4();
		let store = MemoryStore::new();
		store.upsert_user(user_id, dec!(100)).await.unwrap();

		let first = Order::new(
			user_id,
			"https://example.com",
			500,
			dec!(0.0002),
			Some("client-key".into()),
		)
		.unwrap();
		store.create_order_with_tasks(&first, &[]).await.unwrap();
		let balance_after_first = store.user_balance(user_id).await.unwrap();

		let second = Order::new(
			user_id,
			"https://example.com",
			500,
			dec!(0.0002),
			Some("client-key".into()),
		)
		.unwrap();
		let outcome = store.create_order_with_tasks(&second, &[]).await.unwrap();
		match outcome {
			CreateOrderOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
			CreateOrderOutcome::Created(_) => panic!("expected existing order"),
		}
		assert_eq!(store.user_balance(user_id).await.unwrap(), balance_after_first);
	}

	#[tokio::test]
	async fn claim_is_won_by_exactly_one_worker() {
		let (order, tasks) = order_with_tasks(1000, &[500, 500]);
		let store = seeded_store(&order, &tasks).await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);

		let first = store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-a", now)
			.await
			.unwrap();
		assert!(matches!(first, ClaimOutcome::Claimed(_)));

		let second = store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-b", now)
			.await
			.unwrap();
		assert!(matches!(second, ClaimOutcome::Lost));
	}

	#[tokio::test]
	async fn orphan_reclaim_preserves_and_increments_attempts() {
		let (order, tasks) = order_with_tasks(500, &[500]);
		let store = seeded_store(&order, &tasks).await;
		let start = Utc::now();
		let cutoff = start - Duration::seconds(30);

		store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-a", start)
			.await
			.unwrap();

		// Too fresh to reclaim.
		let early = store
			.claim_task(
				tasks[0].id,
				TaskStatus::Executing,
				start - Duration::seconds(30),
				"worker-b",
				start,
			)
			.await
			.unwrap();
		assert!(matches!(early, ClaimOutcome::Lost));

		// Past the orphan cutoff the claim succeeds and attempts keep counting.
		let later = start + Duration::seconds(60);
		let reclaimed = store
			.claim_task(
				tasks[0].id,
				TaskStatus::Executing,
				later - Duration::seconds(30),
				"worker-b",
				later,
			)
			.await
			.unwrap();
		match reclaimed {
			ClaimOutcome::Claimed(task) => {
				assert_eq!(task.attempts, 2);
				assert_eq!(task.worker_id.as_deref(), Some("worker-b"));
			}
			ClaimOutcome::Lost => panic!("expected reclaim"),
		}
	}

	#[tokio::test]
	async fn completion_and_failure_conserve_quantity() {
		let (order, tasks) = order_with_tasks(1000, &[500, 500]);
		let store = seeded_store(&order, &tasks).await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);

		for task in &tasks {
			store
				.claim_task(task.id, TaskStatus::Pending, cutoff, "worker-a", now)
				.await
				.unwrap();
		}

		let progress = store
			.complete_task(tasks[0].id, order.id, 500, now)
			.await
			.unwrap();
		assert_eq!(progress.delivered, 500);
		assert_eq!(progress.remains, 500);
		assert_eq!(
			progress.delivered + progress.failed_permanent + progress.remains,
			progress.quantity
		);

		let progress = store
			.fail_task_permanent(tasks[1].id, order.id, 500, "executor exploded")
			.await
			.unwrap();
		assert_eq!(progress.failed_permanent, 500);
		assert_eq!(progress.remains, 0);
		assert_eq!(
			progress.delivered + progress.failed_permanent + progress.remains,
			progress.quantity
		);
	}

	#[tokio::test]
	async fn stale_completion_is_a_no_op() {
		let (order, tasks) = order_with_tasks(500, &[500]);
		let store = seeded_store(&order, &tasks).await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);

		store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-a", now)
			.await
			.unwrap();
		store.complete_task(tasks[0].id, order.id, 500, now).await.unwrap();

		// A second completion (stale worker) must not double-count.
		let progress = store.complete_task(tasks[0].id, order.id, 500, now).await.unwrap();
		assert_eq!(progress.delivered, 500);
		assert_eq!(progress.remains, 0);
	}

	#[tokio::test]
	async fn refund_applies_exactly_once() {
		let (order, tasks) = order_with_tasks(500, &[500]);
		let store = seeded_store(&order, &tasks).await;
		let now = Utc::now();
		let balance_before = store.user_balance(order.user_id).await.unwrap();
		let amount = dec!(0.1000);

		let first = store
			.apply_refund(tasks[0].id, order.id, order.user_id, amount, true, now)
			.await
			.unwrap();
		assert!(matches!(first, RefundOutcome::Applied(_)));

		let second = store
			.apply_refund(tasks[0].id, order.id, order.user_id, amount, true, now)
			.await
			.unwrap();
		assert!(matches!(second, RefundOutcome::AlreadyRefunded));

		assert_eq!(
			store.user_balance(order.user_id).await.unwrap(),
			balance_before + amount
		);
		let events = store.refund_events_since(now - Duration::hours(1)).await.unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(store.get_order(order.id).await.unwrap().refund_amount, amount);
	}

	#[tokio::test]
	async fn disabled_refund_only_touches_bookkeeping() {
		let (order, tasks) = order_with_tasks(500, &[500]);
		let store = seeded_store(&order, &tasks).await;
		let balance_before = store.user_balance(order.user_id).await.unwrap();

		let outcome = store
			.apply_refund(tasks[0].id, order.id, order.user_id, dec!(0.1), false, Utc::now())
			.await
			.unwrap();
		assert!(matches!(outcome, RefundOutcome::BookkeepingOnly));
		assert!(store.get_task(tasks[0].id).await.unwrap().refunded);
		assert_eq!(store.user_balance(order.user_id).await.unwrap(), balance_before);
		assert_eq!(
			store.get_order(order.id).await.unwrap().refund_amount,
			Decimal::ZERO
		);
	}

	#[tokio::test]
	async fn due_tasks_cover_all_three_readiness_sources() {
		let (order, mut tasks) = order_with_tasks(1500, &[500, 500, 500]);
		let now = Utc::now();
		tasks[0].scheduled_at = now - Duration::seconds(10);
		tasks[1].status = TaskStatus::FailedRetrying;
		tasks[1].retry_after = Some(now - Duration::seconds(5));
		tasks[2].status = TaskStatus::Executing;
		tasks[2].execution_started_at = Some(now - Duration::seconds(300));
		let store = seeded_store(&order, &tasks).await;

		let due = store
			.due_tasks(now, now - Duration::seconds(120), 10)
			.await
			.unwrap();
		assert_eq!(due.len(), 3);

		// A fresh EXECUTING task is not due.
		let fresh_cutoff = now - Duration::seconds(600);
		let due = store.due_tasks(now, fresh_cutoff, 10).await.unwrap();
		assert_eq!(due.len(), 2);
	}

	#[tokio::test]
	async fn node_lease_respects_capacity() {
		let store = MemoryStore::new();
		let node = ProxyNode {
			id: Uuid::new_v4(),
			endpoint: "10.0.0.1:8080".into(),
			tier: ProxyTier::Datacenter,
			country: None,
			capacity: 1,
			current_load: 0,
			status: ProxyNodeStatus::Online,
			auth: None,
		};
		store.insert_node(&node).await.unwrap();

		assert!(store.lease_node(node.id).await.unwrap());
		assert!(!store.lease_node(node.id).await.unwrap());

		// A full node is not a candidate.
		let candidates = store
			.list_candidates(ProxyTier::Datacenter, None, 10)
			.await
			.unwrap();
		assert!(candidates.is_empty());

		store.release_node(node.id).await.unwrap();
		assert!(store.lease_node(node.id).await.unwrap());
	}

	#[tokio::test]
	async fn replanning_is_a_no_op() {
		let (order, tasks) = order_with_tasks(1000, &[500, 500]);
		let store = seeded_store(&order, &tasks).await;

		let outcome = store.insert_tasks(order.id, &tasks).await.unwrap();
		assert_eq!(outcome, PlanOutcome::AlreadyPlanned);
		assert_eq!(store.tasks_for_order(order.id).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn abandoning_open_tasks_updates_order_counters() {
		let (order, mut tasks) = order_with_tasks(1500, &[500, 500, 500]);
		tasks[0].status = TaskStatus::Completed;
		let store = seeded_store(&order, &tasks).await;
		// Mirror the completed task in the order counters.
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);
		store
			.claim_task(tasks[1].id, TaskStatus::Pending, cutoff, "w", now)
			.await
			.unwrap();

		let abandoned = store
			.abandon_open_tasks(order.id, "cancelled by admin")
			.await
			.unwrap();
		assert_eq!(abandoned.len(), 2);
		let progress = store.get_order(order.id).await.unwrap();
		assert_eq!(progress.failed_permanent, 1000);
		assert_eq!(progress.remains, 500);
	}
}
