//! Reconciliation and refund-velocity jobs.
//!
//! Reconciliation periodically re-derives each terminal order's refund
//! aggregates from its task set and records anomalies when the stored
//! aggregates disagree; it never mutates order state. The velocity job flags
//! users whose refund-event rate exceeds the configured threshold.

use crate::EngineError;
use chrono::{Duration as ChronoDuration, Utc};
use playflow_store::{Store, StoreInterface};
use playflow_types::{
	truncate_id, AnomalyKind, AnomalySeverity, FlaggedUser, RefundAnomaly,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

/// Absolute tolerance for refund amount comparisons.
const REFUND_TOLERANCE: &str = "0.01";

/// What one reconciliation pass found.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
	/// Terminal orders with refund activity that were examined.
	pub orders_checked: usize,
	/// New anomalies recorded this pass.
	pub anomalies_recorded: usize,
}

/// Periodic reconciliation of per-order aggregates against per-task
/// aggregates.
pub struct ReconciliationJob {
	store: Store,
	interval: Duration,
	velocity_interval: Duration,
	velocity_threshold: u64,
}

impl ReconciliationJob {
	pub fn new(
		store: Store,
		interval: Duration,
		velocity_interval: Duration,
		velocity_threshold: u64,
	) -> Self {
		Self {
			store,
			interval,
			velocity_interval,
			velocity_threshold,
		}
	}

	/// Runs both jobs on their timers until shutdown.
	pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut reconcile_tick = tokio::time::interval(self.interval);
		reconcile_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		let mut velocity_tick = tokio::time::interval(self.velocity_interval);
		velocity_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// Both intervals fire immediately once; skip the initial ticks so a
		// restart does not double-run the jobs.
		reconcile_tick.tick().await;
		velocity_tick.tick().await;

		loop {
			tokio::select! {
				_ = reconcile_tick.tick() => {
					if let Err(e) = self.reconcile_once().await {
						tracing::error!(error = %e, "Reconciliation pass failed");
					}
				}
				_ = velocity_tick.tick() => {
					if let Err(e) = self.velocity_once().await {
						tracing::error!(error = %e, "Velocity check failed");
					}
				}
				_ = shutdown.changed() => break,
			}
		}
	}

	/// One reconciliation pass over terminal orders with refund activity.
	#[instrument(skip_all)]
	pub async fn reconcile_once(&self) -> Result<ReconcileReport, EngineError> {
		let tolerance: Decimal = REFUND_TOLERANCE
			.parse()
			.unwrap_or_else(|_| Decimal::new(1, 2));
		let orders = self.store.terminal_orders_with_refund_activity().await?;
		let mut report = ReconcileReport {
			orders_checked: orders.len(),
			..ReconcileReport::default()
		};

		for order in orders {
			let tasks = self.store.tasks_for_order(order.id).await?;
			let refunded_quantity: u64 =
				tasks.iter().filter(|t| t.refunded).map(|t| t.quantity).sum();
			let expected_refund = order.price_per_unit * Decimal::from(refunded_quantity);
			let expected_failed = Decimal::from(refunded_quantity);
			let actual_failed = Decimal::from(order.failed_permanent);

			if (expected_refund - order.refund_amount).abs() > tolerance {
				report.anomalies_recorded += self
					.record_if_new(
						order.id,
						AnomalyKind::RefundAmountMismatch,
						expected_refund,
						order.refund_amount,
						AnomalySeverity::Critical,
					)
					.await? as usize;
			}

			if expected_failed != actual_failed {
				report.anomalies_recorded += self
					.record_if_new(
						order.id,
						AnomalyKind::FailedPlaysMismatch,
						expected_failed,
						actual_failed,
						AnomalySeverity::Warning,
					)
					.await? as usize;
			}
		}

		if report.anomalies_recorded > 0 {
			tracing::warn!(
				orders = report.orders_checked,
				anomalies = report.anomalies_recorded,
				"Reconciliation recorded anomalies"
			);
		} else {
			tracing::debug!(orders = report.orders_checked, "Reconciliation clean");
		}
		Ok(report)
	}

	/// Records an anomaly unless an open one with the same key exists.
	async fn record_if_new(
		&self,
		order_id: Uuid,
		kind: AnomalyKind,
		expected: Decimal,
		actual: Decimal,
		severity: AnomalySeverity,
	) -> Result<bool, EngineError> {
		if self.store.open_anomaly_exists(order_id, kind).await? {
			return Ok(false);
		}
		let anomaly = RefundAnomaly {
			id: Uuid::new_v4(),
			order_id,
			kind,
			expected,
			actual,
			severity,
			detected_at: Utc::now(),
			resolved_at: None,
		};
		self.store.record_anomaly(&anomaly).await?;
		tracing::warn!(
			order_id = %truncate_id(&order_id.to_string()),
			kind = kind.as_str(),
			%expected,
			%actual,
			"Recorded reconciliation anomaly"
		);
		Ok(true)
	}

	/// One velocity pass: flags users with more refund events than the
	/// threshold within the trailing hour.
	#[instrument(skip_all)]
	pub async fn velocity_once(&self) -> Result<Vec<FlaggedUser>, EngineError> {
		let now = Utc::now();
		let window_start = now - ChronoDuration::hours(1);
		let events = self.store.refund_events_since(window_start).await?;

		let mut per_user: HashMap<Uuid, u64> = HashMap::new();
		for event in &events {
			*per_user.entry(event.user_id).or_default() += 1;
		}

		let mut flagged = Vec::new();
		for (user_id, count) in per_user {
			if count <= self.velocity_threshold {
				continue;
			}
			let record = FlaggedUser {
				user_id,
				refund_events: count,
				window_start,
				flagged_at: now,
			};
			self.store.flag_user(&record).await?;
			tracing::warn!(
				user_id = %truncate_id(&user_id.to_string()),
				refund_events = count,
				threshold = self.velocity_threshold,
				"High refund velocity"
			);
			flagged.push(record);
		}
		Ok(flagged)
	}
}
