//! Delivery task model.
//!
//! A task is a durable claim on a slice of an order's quantity. Tasks move
//! through their state machine only via the store's claim/complete/fail
//! operations; `execution_started_at` doubles as the orphan-detection stamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum persisted length of a task's last failure reason.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// A unit of work for a slice of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	pub id: Uuid,
	/// Owning order; orders exclusively own their tasks.
	pub order_id: Uuid,
	/// Position within the order's task sequence, 0-based.
	pub sequence_number: u32,
	/// Units this task will attempt to deliver.
	pub quantity: u64,
	/// Earliest time the worker may claim this task.
	pub scheduled_at: DateTime<Utc>,
	pub status: TaskStatus,
	/// Claim attempts so far, including orphan reclaims.
	pub attempts: u32,
	pub max_attempts: u32,
	/// Earliest re-claim time while in FAILED_RETRYING.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<DateTime<Utc>>,
	/// Set on claim; an EXECUTING task whose stamp is older than the orphan
	/// threshold is eligible for re-claim.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub execution_started_at: Option<DateTime<Utc>>,
	/// Worker that last claimed this task, for observability.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub worker_id: Option<String>,
	/// Proxy node the last execution routed through.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub proxy_node_id: Option<Uuid>,
	/// Unique within the order; makes re-planning a no-op.
	pub idempotency_token: String,
	/// Set exactly once when a FAILED_PERMANENT task has credited the ledger.
	pub refunded: bool,
	/// Last failure reason, truncated to [`MAX_ERROR_MESSAGE_LEN`].
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
	/// Truncates a failure reason to the persisted limit.
	pub fn truncate_error(message: &str) -> String {
		if message.len() <= MAX_ERROR_MESSAGE_LEN {
			message.to_string()
		} else {
			let mut end = MAX_ERROR_MESSAGE_LEN;
			while !message.is_char_boundary(end) {
				end -= 1;
			}
			message[..end].to_string()
		}
	}

	/// Whether this task has exhausted its retry budget.
	pub fn attempts_exhausted(&self) -> bool {
		self.attempts >= self.max_attempts
	}
}

/// Status of a delivery task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
	/// Waiting for its schedule to mature.
	Pending,
	/// Claimed by a worker.
	Executing,
	/// Delivered successfully.
	Completed,
	/// Failed transiently; eligible for re-claim after `retry_after`.
	FailedRetrying,
	/// Abandoned after exhausting `max_attempts`; funds refunded.
	FailedPermanent,
}

impl TaskStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaskStatus::Pending => "PENDING",
			TaskStatus::Executing => "EXECUTING",
			TaskStatus::Completed => "COMPLETED",
			TaskStatus::FailedRetrying => "FAILED_RETRYING",
			TaskStatus::FailedPermanent => "FAILED_PERMANENT",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, TaskStatus::Completed | TaskStatus::FailedPermanent)
	}
}

impl std::str::FromStr for TaskStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(TaskStatus::Pending),
			"EXECUTING" => Ok(TaskStatus::Executing),
			"COMPLETED" => Ok(TaskStatus::Completed),
			"FAILED_RETRYING" => Ok(TaskStatus::FailedRetrying),
			"FAILED_PERMANENT" => Ok(TaskStatus::FailedPermanent),
			other => Err(format!("unknown task status: {other}")),
		}
	}
}

impl std::fmt::Display for TaskStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
