//! Invariant validator.
//!
//! On-demand, read-only verifier of the engine's accounting laws: quantity
//! conservation, the refund cap, terminal-state consistency, idempotency-key
//! uniqueness, per-order token uniqueness, and stuck-execution detection.
//! Returns a structured report; never mutates state.

use crate::EngineError;
use chrono::{Duration as ChronoDuration, Utc};
use playflow_store::{Store, StoreInterface};
use playflow_types::{Order, TaskStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// The invariant a violation belongs to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvariantKind {
	/// delivered + failed_permanent + remains == quantity.
	QuantityConservation,
	/// refund_amount <= failed_permanent * price_per_unit (+ tolerance).
	RefundCap,
	/// Terminal orders only carry terminal tasks.
	TerminalTasks,
	/// At most one order per (user_id, external_key).
	IdempotencyKey,
	/// Idempotency tokens unique within an order.
	TokenUniqueness,
	/// No task stuck in EXECUTING past the allowed age.
	StuckExecution,
}

/// One violated invariant with enough context to investigate.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
	pub invariant: InvariantKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub order_id: Option<Uuid>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<Uuid>,
	pub detail: String,
}

/// Result of a validation run.
#[derive(Debug, Clone, Serialize, Default)]
pub struct InvariantReport {
	pub orders_checked: usize,
	pub tasks_checked: usize,
	pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
	pub fn is_clean(&self) -> bool {
		self.violations.is_empty()
	}
}

/// Read-only verifier of the engine's conservation laws.
pub struct InvariantValidator {
	store: Store,
	/// EXECUTING tasks older than this are reported stuck; sized as
	/// orphan threshold plus one cycle interval.
	stuck_after: Duration,
}

impl InvariantValidator {
	pub fn new(store: Store, stuck_after: Duration) -> Self {
		Self { store, stuck_after }
	}

	/// Validates a single order.
	pub async fn validate_order(&self, order_id: Uuid) -> Result<InvariantReport, EngineError> {
		let order = self.store.get_order(order_id).await?;
		let mut report = InvariantReport {
			orders_checked: 1,
			..InvariantReport::default()
		};
		self.check_order(&order, &mut report).await?;
		Ok(report)
	}

	/// Validates every order, plus the cross-order idempotency-key law.
	pub async fn validate_all(&self) -> Result<InvariantReport, EngineError> {
		let orders = self.store.all_orders().await?;
		let mut report = InvariantReport {
			orders_checked: orders.len(),
			..InvariantReport::default()
		};

		let mut seen_keys: HashMap<(Uuid, String), Uuid> = HashMap::new();
		for order in &orders {
			if let Some(key) = &order.external_key {
				if let Some(previous) =
					seen_keys.insert((order.user_id, key.clone()), order.id)
				{
					report.violations.push(InvariantViolation {
						invariant: InvariantKind::IdempotencyKey,
						order_id: Some(order.id),
						task_id: None,
						detail: format!(
							"external key '{key}' also used by order {previous}"
						),
					});
				}
			}
		}

		for order in &orders {
			self.check_order(order, &mut report).await?;
		}
		Ok(report)
	}

	async fn check_order(
		&self,
		order: &Order,
		report: &mut InvariantReport,
	) -> Result<(), EngineError> {
		if order.delivered + order.failed_permanent + order.remains != order.quantity {
			report.violations.push(InvariantViolation {
				invariant: InvariantKind::QuantityConservation,
				order_id: Some(order.id),
				task_id: None,
				detail: format!(
					"delivered {} + failed {} + remains {} != quantity {}",
					order.delivered, order.failed_permanent, order.remains, order.quantity
				),
			});
		}

		// One least-significant unit of the price is tolerated.
		let tolerance = Decimal::new(1, order.price_per_unit.scale());
		let cap = order.price_per_unit * Decimal::from(order.failed_permanent) + tolerance;
		if order.refund_amount > cap {
			report.violations.push(InvariantViolation {
				invariant: InvariantKind::RefundCap,
				order_id: Some(order.id),
				task_id: None,
				detail: format!(
					"refund {} exceeds cap {} for {} failed units",
					order.refund_amount, cap, order.failed_permanent
				),
			});
		}

		let tasks = self.store.tasks_for_order(order.id).await?;
		report.tasks_checked += tasks.len();

		let mut tokens: HashSet<&str> = HashSet::with_capacity(tasks.len());
		let stuck_cutoff = Utc::now()
			- ChronoDuration::from_std(self.stuck_after)
				.unwrap_or_else(|_| ChronoDuration::seconds(150));
		for task in &tasks {
			if order.status.is_terminal() && !task.status.is_terminal() {
				report.violations.push(InvariantViolation {
					invariant: InvariantKind::TerminalTasks,
					order_id: Some(order.id),
					task_id: Some(task.id),
					detail: format!(
						"order is {} but task {} is {}",
						order.status, task.sequence_number, task.status
					),
				});
			}
			if !tokens.insert(task.idempotency_token.as_str()) {
				report.violations.push(InvariantViolation {
					invariant: InvariantKind::TokenUniqueness,
					order_id: Some(order.id),
					task_id: Some(task.id),
					detail: format!(
						"duplicate idempotency token '{}'",
						task.idempotency_token
					),
				});
			}
			if task.status == TaskStatus::Executing
				&& task.execution_started_at.is_some_and(|at| at <= stuck_cutoff)
			{
				report.violations.push(InvariantViolation {
					invariant: InvariantKind::StuckExecution,
					order_id: Some(order.id),
					task_id: Some(task.id),
					detail: format!(
						"executing since {:?}, past the stuck cutoff",
						task.execution_started_at
					),
				});
			}
		}
		Ok(())
	}
}
