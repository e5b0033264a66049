//! Order model for the playflow delivery engine.
//!
//! An order is a request from a user to deliver a quantity of plays against a
//! target URL. Its progress counters obey a conservation law: at any point,
//! `delivered + failed_permanent + remains == quantity`. Counters only move
//! through the store's conditional-increment operations, never by
//! read-modify-write at the application layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::format_count;

/// Errors raised when constructing an order from raw request data.
#[derive(Debug, Error)]
pub enum OrderValidationError {
	/// The requested quantity was zero.
	#[error("Quantity must be positive")]
	ZeroQuantity,
	/// The unit price was zero or negative.
	#[error("Price per unit must be positive")]
	NonPositivePrice,
	/// The target URL was empty.
	#[error("Target URL must not be empty")]
	EmptyTargetUrl,
	/// The client-supplied idempotency key was empty.
	#[error("External key must not be empty when present")]
	EmptyExternalKey,
}

/// A request from a user to deliver `quantity` plays for `target_url`.
///
/// `delivered`, `failed_permanent` and `refund_amount` are monotonically
/// non-decreasing. `remains` is stored (rather than derived on read) so the
/// store can compare-and-decrement it atomically under concurrent task
/// completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
	/// Stable opaque identifier.
	pub id: Uuid,
	/// Owning user.
	pub user_id: Uuid,
	/// URL the plays are delivered against.
	pub target_url: String,
	/// Total units requested; immutable after creation.
	pub quantity: u64,
	/// Successfully delivered units.
	pub delivered: u64,
	/// Permanently abandoned units.
	pub failed_permanent: u64,
	/// Units still owed: `quantity - delivered - failed_permanent`.
	pub remains: u64,
	/// Unit price fixed at creation, four or more fractional digits.
	pub price_per_unit: Decimal,
	/// `quantity * price_per_unit`.
	pub total_cost: Decimal,
	/// Sum of credits issued against this order.
	pub refund_amount: Decimal,
	/// Current lifecycle status.
	pub status: OrderStatus,
	/// Optional client-supplied idempotency key, unique per user.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub external_key: Option<String>,
	/// Timestamp when the order was accepted.
	pub created_at: DateTime<Utc>,
	/// Timestamp when delivery began.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	/// End of the delivery window task schedules are spread across.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_completion_at: Option<DateTime<Utc>>,
	/// Timestamp of the terminal transition.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
	/// Human-readable summary, populated on terminal transition.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub notes: Option<String>,
}

impl Order {
	/// Creates a new pending order, validating the request fields and
	/// computing `total_cost`.
	pub fn new(
		user_id: Uuid,
		target_url: impl Into<String>,
		quantity: u64,
		price_per_unit: Decimal,
		external_key: Option<String>,
	) -> Result<Self, OrderValidationError> {
		let target_url = target_url.into();
		if quantity == 0 {
			return Err(OrderValidationError::ZeroQuantity);
		}
		if price_per_unit <= Decimal::ZERO {
			return Err(OrderValidationError::NonPositivePrice);
		}
		if target_url.is_empty() {
			return Err(OrderValidationError::EmptyTargetUrl);
		}
		if external_key.as_deref().is_some_and(str::is_empty) {
			return Err(OrderValidationError::EmptyExternalKey);
		}

		let total_cost = price_per_unit * Decimal::from(quantity);
		Ok(Self {
			id: Uuid::new_v4(),
			user_id,
			target_url,
			quantity,
			delivered: 0,
			failed_permanent: 0,
			remains: quantity,
			price_per_unit,
			total_cost,
			refund_amount: Decimal::ZERO,
			status: OrderStatus::Pending,
			external_key,
			created_at: Utc::now(),
			started_at: None,
			estimated_completion_at: None,
			completed_at: None,
			notes: None,
		})
	}

	/// Whether the conservation law `delivered + failed_permanent + remains ==
	/// quantity` currently holds.
	pub fn conserves_quantity(&self) -> bool {
		self.delivered + self.failed_permanent + self.remains == self.quantity
	}

	/// Synthesizes the terminal summary string for this order.
	///
	/// Orders that abandoned units carry a `(PARTIAL)` marker and quote the
	/// refunded amount.
	pub fn completion_notes(&self) -> String {
		let mut notes = format!(
			"Delivered: {} | Failed: {}",
			format_count(self.delivered),
			format_count(self.failed_permanent)
		);
		if self.failed_permanent > 0 {
			notes.push_str(&format!(" (PARTIAL) | Refunded: ${}", self.refund_amount));
		}
		notes
	}
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
	/// Accepted, tasks not yet (fully) planned or started.
	Pending,
	/// Delivery in progress.
	Running,
	/// All units accounted for; possibly partial via notes.
	Completed,
	/// Terminated by admin action.
	Cancelled,
	/// Completely unrecoverable.
	Failed,
}

impl OrderStatus {
	/// Stable string form, matching the store schema.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Pending => "PENDING",
			OrderStatus::Running => "RUNNING",
			OrderStatus::Completed => "COMPLETED",
			OrderStatus::Cancelled => "CANCELLED",
			OrderStatus::Failed => "FAILED",
		}
	}

	/// Whether this status admits no further transitions.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
		)
	}
}

impl std::str::FromStr for OrderStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(OrderStatus::Pending),
			"RUNNING" => Ok(OrderStatus::Running),
			"COMPLETED" => Ok(OrderStatus::Completed),
			"CANCELLED" => Ok(OrderStatus::Cancelled),
			"FAILED" => Ok(OrderStatus::Failed),
			other => Err(format!("unknown order status: {other}")),
		}
	}
}

impl std::fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rust_decimal_macros::dec;

	#[test]
	fn new_order_computes_cost_and_counters() {
		let order = Order::new(Uuid::new_v4(), "https://example.com/track/1", 15000, dec!(0.0002), None)
			.unwrap();
		assert_eq!(order.total_cost, dec!(3.0000));
		assert_eq!(order.remains, 15000);
		assert_eq!(order.status, OrderStatus::Pending);
		assert!(order.conserves_quantity());
	}

	#[test]
	fn rejects_invalid_requests() {
		let user = Uuid::new_v4();
		assert!(matches!(
			Order::new(user, "https://example.com", 0, dec!(0.0002), None),
			Err(OrderValidationError::ZeroQuantity)
		));
		assert!(matches!(
			Order::new(user, "https://example.com", 10, dec!(0), None),
			Err(OrderValidationError::NonPositivePrice)
		));
		assert!(matches!(
			Order::new(user, "", 10, dec!(0.0002), None),
			Err(OrderValidationError::EmptyTargetUrl)
		));
		assert!(matches!(
			Order::new(user, "https://example.com", 10, dec!(0.0002), Some(String::new())),
			Err(OrderValidationError::EmptyExternalKey)
		));
	}

	#[test]
	fn completion_notes_formats() {
		let mut order =
			Order::new(Uuid::new_v4(), "https://example.com", 15000, dec!(0.0002), None).unwrap();
		order.delivered = 15000;
		order.remains = 0;
		assert_eq!(order.completion_notes(), "Delivered: 15,000 | Failed: 0");

		order.delivered = 14500;
		order.failed_permanent = 500;
		order.refund_amount = dec!(0.1000);
		assert_eq!(
			order.completion_notes(),
			"Delivered: 14,500 | Failed: 500 (PARTIAL) | Refunded: $0.1000"
		);
	}

	#[test]
	fn status_round_trips_through_strings() {
		for status in [
			OrderStatus::Pending,
			OrderStatus::Running,
			OrderStatus::Completed,
			OrderStatus::Cancelled,
			OrderStatus::Failed,
		] {
			assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
		}
		assert!("DONE".parse::<OrderStatus>().is_err());
	}
}
