//! Balance ledger, refund event, and anomaly records.
//!
//! The ledger is append-only and exclusively owns balance history: every
//! balance change is recorded with its before/after snapshot. Refund events
//! are the ground truth for fraud-velocity analysis; anomalies record
//! discrepancies found by reconciliation and stay open until an operator
//! resolves them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a balance ledger entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
	/// Charge at order creation.
	Debit,
	/// Credit back for a permanently failed task.
	Refund,
	/// Funds added to the account.
	Credit,
	/// Manual operator correction.
	Adjust,
}

impl LedgerEntryKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			LedgerEntryKind::Debit => "DEBIT",
			LedgerEntryKind::Refund => "REFUND",
			LedgerEntryKind::Credit => "CREDIT",
			LedgerEntryKind::Adjust => "ADJUST",
		}
	}
}

impl std::str::FromStr for LedgerEntryKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"DEBIT" => Ok(LedgerEntryKind::Debit),
			"REFUND" => Ok(LedgerEntryKind::Refund),
			"CREDIT" => Ok(LedgerEntryKind::Credit),
			"ADJUST" => Ok(LedgerEntryKind::Adjust),
			other => Err(format!("unknown ledger entry kind: {other}")),
		}
	}
}

/// A single append-only balance transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
	pub id: Uuid,
	pub user_id: Uuid,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub order_id: Option<Uuid>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<Uuid>,
	/// Signed amount; debits are negative.
	pub amount: Decimal,
	pub balance_before: Decimal,
	pub balance_after: Decimal,
	pub kind: LedgerEntryKind,
	pub reason: String,
	pub at: DateTime<Utc>,
}

/// Append-only record of a credit issued for a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundEvent {
	pub id: Uuid,
	pub user_id: Uuid,
	pub order_id: Uuid,
	pub task_id: Uuid,
	pub amount: Decimal,
	pub at: DateTime<Utc>,
}

/// Kind of discrepancy found by reconciliation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
	/// Per-order refund total disagrees with the refunded task set.
	RefundAmountMismatch,
	/// Per-order failed-plays counter disagrees with the refunded task set.
	FailedPlaysMismatch,
}

impl AnomalyKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			AnomalyKind::RefundAmountMismatch => "REFUND_AMOUNT_MISMATCH",
			AnomalyKind::FailedPlaysMismatch => "FAILED_PLAYS_MISMATCH",
		}
	}
}

impl std::str::FromStr for AnomalyKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"REFUND_AMOUNT_MISMATCH" => Ok(AnomalyKind::RefundAmountMismatch),
			"FAILED_PLAYS_MISMATCH" => Ok(AnomalyKind::FailedPlaysMismatch),
			other => Err(format!("unknown anomaly kind: {other}")),
		}
	}
}

/// Severity assigned to an anomaly when it is detected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalySeverity {
	Warning,
	Critical,
}

impl AnomalySeverity {
	pub fn as_str(&self) -> &'static str {
		match self {
			AnomalySeverity::Warning => "WARNING",
			AnomalySeverity::Critical => "CRITICAL",
		}
	}
}

impl std::str::FromStr for AnomalySeverity {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"WARNING" => Ok(AnomalySeverity::Warning),
			"CRITICAL" => Ok(AnomalySeverity::Critical),
			other => Err(format!("unknown anomaly severity: {other}")),
		}
	}
}

/// Open-until-resolved record of a reconciliation discrepancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundAnomaly {
	pub id: Uuid,
	pub order_id: Uuid,
	pub kind: AnomalyKind,
	pub expected: Decimal,
	pub actual: Decimal,
	pub severity: AnomalySeverity,
	pub detected_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resolved_at: Option<DateTime<Utc>>,
}

impl RefundAnomaly {
	pub fn is_open(&self) -> bool {
		self.resolved_at.is_none()
	}
}

/// A user whose refund-event velocity exceeded the configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaggedUser {
	pub user_id: Uuid,
	/// Refund events observed within the window.
	pub refund_events: u64,
	pub window_start: DateTime<Utc>,
	pub flagged_at: DateTime<Utc>,
}
