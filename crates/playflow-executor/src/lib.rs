//! Executor client for the playflow delivery engine.
//!
//! The physical delivery of plays is performed by an external proxy executor;
//! this module provides the client seam the worker dispatches through. It
//! abstracts over delivery mechanisms: an HTTP client for the real executor
//! and a mock with failure injection for development and tests.

use async_trait::async_trait;
use playflow_types::{ExecutionRequest, ExecutionResponse};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod http;
	pub mod mock;
}

/// Errors that can occur while calling the executor.
///
/// All of these are transient from the worker's point of view: the attempt
/// failed, the task follows the retry policy.
#[derive(Debug, Error)]
pub enum ExecutorError {
	/// Error that occurs during network communication.
	#[error("Network error: {0}")]
	Network(String),
	/// The per-call timeout elapsed before the executor answered.
	#[error("Execution timed out after {0:?}")]
	Timeout(Duration),
	/// The executor answered with a malformed payload.
	#[error("Invalid executor response: {0}")]
	InvalidResponse(String),
}

/// Trait defining the interface for executor backends.
#[async_trait]
pub trait ExecutorInterface: Send + Sync {
	/// Performs one delivery attempt and returns the executor's verdict.
	///
	/// A returned [`ExecutionResponse`] with `success = false` is a verdict,
	/// not an error; errors mean the attempt never produced one.
	async fn execute(&self, request: &ExecutionRequest)
		-> Result<ExecutionResponse, ExecutorError>;
}

/// Service wrapping an executor backend with the per-call timeout.
///
/// The worker calls through this service so a hung executor cannot stall a
/// task slot past the configured deadline.
pub struct ExecutorService {
	backend: Box<dyn ExecutorInterface>,
	call_timeout: Duration,
}

impl ExecutorService {
	pub fn new(backend: Box<dyn ExecutorInterface>, call_timeout: Duration) -> Self {
		Self {
			backend,
			call_timeout,
		}
	}

	/// Executes one delivery attempt, enforcing the call timeout.
	pub async fn execute(
		&self,
		request: &ExecutionRequest,
	) -> Result<ExecutionResponse, ExecutorError> {
		match tokio::time::timeout(self.call_timeout, self.backend.execute(request)).await {
			Ok(result) => result,
			Err(_) => Err(ExecutorError::Timeout(self.call_timeout)),
		}
	}
}
