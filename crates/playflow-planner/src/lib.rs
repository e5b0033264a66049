//! Task planner for the playflow delivery engine.
//!
//! Splits an accepted order into a finite sequence of delivery tasks with a
//! schedule spread linearly across the order's delivery window, so no burst
//! of tasks becomes ready at the same instant. Task identity is pinned by an
//! idempotency token derived from the order id and sequence number, which
//! makes planning the same order twice a no-op at the store.

use chrono::{DateTime, Duration, Utc};
use playflow_types::{Order, Task, TaskStatus};
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during task planning.
#[derive(Debug, Error)]
pub enum PlannerError {
	/// The order has nothing to deliver.
	#[error("Order {0} has zero quantity")]
	ZeroQuantity(Uuid),
	/// The order's delivery window is missing or inverted.
	#[error("Order {0} has no usable delivery window")]
	InvalidWindow(Uuid),
}

/// Derives the idempotency token for a task slot.
///
/// The token is a function of `(order_id, sequence_number)` only, so the same
/// order always plans to the same task identities.
pub fn idempotency_token(order_id: Uuid, sequence_number: u32) -> String {
	let mut hasher = Sha3_256::new();
	hasher.update(order_id.as_bytes());
	hasher.update(sequence_number.to_be_bytes());
	hex::encode(&hasher.finalize()[..16])
}

/// Splits orders into scheduled task batches.
pub struct TaskPlanner {
	split_size: u64,
	instant_threshold: u64,
	force_task_delivery: bool,
	max_attempts: u32,
}

impl TaskPlanner {
	pub fn new(
		split_size: u64,
		instant_threshold: u64,
		force_task_delivery: bool,
		max_attempts: u32,
	) -> Self {
		Self {
			split_size: split_size.max(1),
			instant_threshold,
			force_task_delivery,
			max_attempts,
		}
	}

	/// Whether an order of this quantity skips task delivery entirely.
	///
	/// The instant path is a dev convenience; `force_task_delivery` disables
	/// it globally.
	pub fn is_instant(&self, quantity: u64) -> bool {
		!self.force_task_delivery && quantity <= self.instant_threshold
	}

	/// Generates the task batch for an order.
	///
	/// Produces ceil(quantity / split_size) tasks whose quantities sum to the
	/// order quantity, with the last task carrying any remainder. Schedules
	/// are spread linearly across `started_at ..= estimated_completion_at`.
	pub fn plan(&self, order: &Order) -> Result<Vec<Task>, PlannerError> {
		if order.quantity == 0 {
			return Err(PlannerError::ZeroQuantity(order.id));
		}
		let window_start = order.started_at.ok_or(PlannerError::InvalidWindow(order.id))?;
		let window_end = order
			.estimated_completion_at
			.ok_or(PlannerError::InvalidWindow(order.id))?;
		if window_end < window_start {
			return Err(PlannerError::InvalidWindow(order.id));
		}

		let count = order.quantity.div_ceil(self.split_size);
		let mut tasks = Vec::with_capacity(count as usize);
		let mut remaining = order.quantity;
		for sequence_number in 0..count {
			let quantity = remaining.min(self.split_size);
			remaining -= quantity;
			tasks.push(Task {
				id: Uuid::new_v4(),
				order_id: order.id,
				sequence_number: sequence_number as u32,
				quantity,
				scheduled_at: spread(window_start, window_end, sequence_number, count),
				status: TaskStatus::Pending,
				attempts: 0,
				max_attempts: self.max_attempts,
				retry_after: None,
				execution_started_at: None,
				worker_id: None,
				proxy_node_id: None,
				idempotency_token: idempotency_token(order.id, sequence_number as u32),
				refunded: false,
				error_message: None,
				completed_at: None,
			});
		}
		Ok(tasks)
	}
}

/// Linear position of slot `index` of `count` within the window.
fn spread(
	start: DateTime<Utc>,
	end: DateTime<Utc>,
	index: u64,
	count: u64,
) -> DateTime<Utc> {
	if count <= 1 {
		return start;
	}
	let window_ms = (end - start).num_milliseconds().max(0);
	let offset_ms = window_ms * index as i64 / count as i64;
	start + Duration::milliseconds(offset_ms)
}

#[cfg(test)]
mod tests {
	use super::*;
	use playflow_types::OrderStatus;
	use rust_decimal_macros::dec;

	fn running_order(quantity: u64, window_secs: i64) -> Order {
		let mut order =
			Order::new(Uuid::new_v4(), "https://example.com/track", quantity, dec!(0.0002), None)
				.unwrap();
		let now = Utc::now();
		order.status = OrderStatus::Running;
		order.started_at = Some(now);
		order.estimated_completion_at = Some(now + Duration::seconds(window_secs));
		order
	}

	fn planner() -> TaskPlanner {
		TaskPlanner::new(500, 1000, true, 3)
	}

	#[test]
	fn task_quantities_sum_to_order_quantity() {
		let order = running_order(15000, 3600);
		let tasks = planner().plan(&order).unwrap();
		assert_eq!(tasks.len(), 30);
		assert_eq!(tasks.iter().map(|t| t.quantity).sum::<u64>(), 15000);
		assert!(tasks.iter().all(|t| t.quantity == 500));
	}

	#[test]
	fn last_task_carries_the_remainder() {
		let order = running_order(1234, 3600);
		let tasks = planner().plan(&order).unwrap();
		assert_eq!(tasks.len(), 3);
		assert_eq!(tasks[0].quantity, 500);
		assert_eq!(tasks[1].quantity, 500);
		assert_eq!(tasks[2].quantity, 234);
		assert_eq!(tasks.iter().map(|t| t.quantity).sum::<u64>(), 1234);
	}

	#[test]
	fn single_unit_order_yields_one_task() {
		let order = running_order(1, 3600);
		let tasks = planner().plan(&order).unwrap();
		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].quantity, 1);
		assert_eq!(tasks[0].scheduled_at, order.started_at.unwrap());
	}

	#[test]
	fn schedules_spread_across_the_window() {
		let order = running_order(5000, 1000);
		let tasks = planner().plan(&order).unwrap();
		let start = order.started_at.unwrap();

		// Monotonically non-decreasing and strictly inside the window.
		for pair in tasks.windows(2) {
			assert!(pair[0].scheduled_at <= pair[1].scheduled_at);
		}
		assert_eq!(tasks[0].scheduled_at, start);
		let last = tasks.last().unwrap().scheduled_at;
		assert!(last < order.estimated_completion_at.unwrap());
		assert!(last > start);
	}

	#[test]
	fn tokens_are_deterministic_and_unique_within_an_order() {
		let order = running_order(5000, 3600);
		let first = planner().plan(&order).unwrap();
		let second = planner().plan(&order).unwrap();

		for (a, b) in first.iter().zip(second.iter()) {
			assert_eq!(a.idempotency_token, b.idempotency_token);
		}

		let mut tokens: Vec<&str> =
			first.iter().map(|t| t.idempotency_token.as_str()).collect();
		tokens.sort_unstable();
		tokens.dedup();
		assert_eq!(tokens.len(), first.len());

		// A different order plans to different identities.
		let other = running_order(5000, 3600);
		let other_tasks = planner().plan(&other).unwrap();
		assert_ne!(first[0].idempotency_token, other_tasks[0].idempotency_token);
	}

	#[test]
	fn zero_quantity_is_rejected() {
		let mut order = running_order(10, 3600);
		order.quantity = 0;
		assert!(matches!(
			planner().plan(&order),
			Err(PlannerError::ZeroQuantity(_))
		));
	}

	#[test]
	fn missing_window_is_rejected() {
		let mut order = running_order(1000, 3600);
		order.estimated_completion_at = None;
		assert!(matches!(
			planner().plan(&order),
			Err(PlannerError::InvalidWindow(_))
		));
	}

	#[test]
	fn instant_path_honors_force_flag() {
		let relaxed = TaskPlanner::new(500, 1000, false, 3);
		assert!(relaxed.is_instant(800));
		assert!(!relaxed.is_instant(1500));

		let forced = TaskPlanner::new(500, 1000, true, 3);
		assert!(!forced.is_instant(800));
	}
}
