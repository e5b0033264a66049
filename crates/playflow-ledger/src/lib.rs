//! Ledger and refund engine for the playflow delivery engine.
//!
//! Ties the accounting guarantee together: every ordered play is either
//! delivered or explicitly refunded. The debit happens inside the order
//! creation transaction at the store; this module owns the credit side —
//! exactly-once refunds for permanently failed tasks, keyed on the task's
//! `refunded` flag so the path can be retried freely.

use chrono::Utc;
use playflow_store::{RefundOutcome, Store, StoreError, StoreInterface};
use playflow_types::{truncate_id, Task};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during refund operations.
#[derive(Debug, Error)]
pub enum LedgerError {
	/// Error from the durable store.
	#[error("Store error: {0}")]
	Store(#[from] StoreError),
}

/// Issues credits for permanently failed tasks.
pub struct RefundEngine {
	store: Store,
	/// When false, the refunded flag still flips but no credit is issued;
	/// test environments only.
	refund_enabled: bool,
}

impl RefundEngine {
	pub fn new(store: Store, refund_enabled: bool) -> Self {
		Self {
			store,
			refund_enabled,
		}
	}

	/// The credit owed for a task slice at the order's unit price.
	pub fn refund_amount(task_quantity: u64, price_per_unit: Decimal) -> Decimal {
		price_per_unit * Decimal::from(task_quantity)
	}

	/// Credits the user for a task that just became FAILED_PERMANENT.
	///
	/// Safe to call any number of times: the store applies the credit only
	/// when it wins the `refunded = false -> true` flip. A failure inside the
	/// refund transaction leaves the flag unset, and reconciliation will
	/// surface the gap.
	pub async fn refund_task(&self, task: &Task) -> Result<RefundOutcome, LedgerError> {
		let order = self.store.get_order(task.order_id).await?;
		let amount = Self::refund_amount(task.quantity, order.price_per_unit);
		let outcome = self
			.store
			.apply_refund(
				task.id,
				order.id,
				order.user_id,
				amount,
				self.refund_enabled,
				Utc::now(),
			)
			.await?;

		match &outcome {
			RefundOutcome::Applied(entry) => {
				tracing::info!(
					order_id = %truncate_id(&order.id.to_string()),
					task_id = %truncate_id(&task.id.to_string()),
					amount = %entry.amount,
					"Refunded failed task"
				);
			}
			RefundOutcome::BookkeepingOnly => {
				tracing::debug!(
					task_id = %truncate_id(&task.id.to_string()),
					"Refunds disabled, bookkeeping only"
				);
			}
			RefundOutcome::AlreadyRefunded => {
				tracing::debug!(
					task_id = %truncate_id(&task.id.to_string()),
					"Refund already applied"
				);
			}
		}
		Ok(outcome)
	}

	/// Refunds a batch of abandoned tasks; used by order cancellation.
	///
	/// Returns the number of credits actually applied this call.
	pub async fn refund_abandoned(&self, tasks: &[Task]) -> Result<usize, LedgerError> {
		let mut applied = 0;
		for task in tasks {
			if matches!(self.refund_task(task).await?, RefundOutcome::Applied(_)) {
				applied += 1;
			}
		}
		Ok(applied)
	}

	/// Current balance for a user.
	pub async fn balance(&self, user_id: Uuid) -> Result<Decimal, LedgerError> {
		Ok(self.store.user_balance(user_id).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use playflow_store::implementations::memory::MemoryStore;
	use playflow_store::StoreInterface;
	use playflow_types::{Order, TaskStatus};
	use rust_decimal_macros::dec;
	use std::sync::Arc;

	async fn seeded() -> (Store, Order, Task) {
		let store: Store = Arc::new(MemoryStore::new());
		let user_id = Uuid::new_v4();
		store.upsert_user(user_id, dec!(50)).await.unwrap();
		let order =
			Order::new(user_id, "https://example.com/track", 1000, dec!(0.0002), None).unwrap();
		let task = Task {
			id: Uuid::new_v4(),
			order_id: order.id,
			sequence_number: 0,
			quantity: 500,
			scheduled_at: Utc::now(),
			status: TaskStatus::FailedPermanent,
			attempts: 3,
			max_attempts: 3,
			retry_after: None,
			execution_started_at: None,
			worker_id: None,
			proxy_node_id: None,
			idempotency_token: "token-0".into(),
			refunded: false,
			error_message: Some("executor unreachable".into()),
			completed_at: None,
		};
		store
			.create_order_with_tasks(&order, std::slice::from_ref(&task))
			.await
			.unwrap();
		(store, order, task)
	}

	#[tokio::test]
	async fn refund_amount_uses_unit_price() {
		assert_eq!(RefundEngine::refund_amount(500, dec!(0.0002)), dec!(0.1000));
		assert_eq!(RefundEngine::refund_amount(0, dec!(0.0002)), dec!(0));
	}

	#[tokio::test]
	async fn refunding_twice_credits_once() {
		let (store, order, task) = seeded().await;
		let engine = RefundEngine::new(store.clone(), true);
		let balance_before = store.user_balance(order.user_id).await.unwrap();

		let first = engine.refund_task(&task).await.unwrap();
		assert!(matches!(first, RefundOutcome::Applied(_)));
		let second = engine.refund_task(&task).await.unwrap();
		assert!(matches!(second, RefundOutcome::AlreadyRefunded));

		assert_eq!(
			store.user_balance(order.user_id).await.unwrap(),
			balance_before + dec!(0.1000)
		);
	}

	#[tokio::test]
	async fn disabled_refunds_flip_the_flag_only() {
		let (store, order, task) = seeded().await;
		let engine = RefundEngine::new(store.clone(), false);
		let balance_before = store.user_balance(order.user_id).await.unwrap();

		let outcome = engine.refund_task(&task).await.unwrap();
		assert!(matches!(outcome, RefundOutcome::BookkeepingOnly));
		assert!(store.get_task(task.id).await.unwrap().refunded);
		assert_eq!(store.user_balance(order.user_id).await.unwrap(), balance_before);
	}

	#[tokio::test]
	async fn abandoned_batch_counts_applied_credits() {
		let (store, _, task) = seeded().await;
		let engine = RefundEngine::new(store.clone(), true);

		let applied = engine
			.refund_abandoned(std::slice::from_ref(&task))
			.await
			.unwrap();
		assert_eq!(applied, 1);

		// Second pass is fully idempotent.
		let applied = engine
			.refund_abandoned(std::slice::from_ref(&task))
			.await
			.unwrap();
		assert_eq!(applied, 0);
	}
}
