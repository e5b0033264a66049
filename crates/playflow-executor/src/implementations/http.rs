//! HTTP executor backend.
//!
//! Posts execution requests as JSON to the external proxy executor and
//! decodes its verdict. Connection handling, retries across attempts, and
//! ban-code interpretation all live with the caller; this client performs
//! exactly one attempt per call.

use crate::{ExecutorError, ExecutorInterface};
use async_trait::async_trait;
use playflow_types::{ExecutionRequest, ExecutionResponse};
use std::time::Duration;

/// Executor client talking to the real proxy executor over HTTP.
pub struct HttpExecutor {
	client: reqwest::Client,
	endpoint: String,
}

impl HttpExecutor {
	/// Creates a client for the executor at `endpoint`.
	///
	/// The reqwest-level timeout is a transport guard; the engine-level
	/// per-call timeout is enforced by [`crate::ExecutorService`].
	pub fn new(endpoint: impl Into<String>, transport_timeout: Duration) -> Result<Self, ExecutorError> {
		let client = reqwest::Client::builder()
			.timeout(transport_timeout)
			.build()
			.map_err(|e| ExecutorError::Network(e.to_string()))?;
		Ok(Self {
			client,
			endpoint: endpoint.into(),
		})
	}
}

#[async_trait]
impl ExecutorInterface for HttpExecutor {
	async fn execute(
		&self,
		request: &ExecutionRequest,
	) -> Result<ExecutionResponse, ExecutorError> {
		let response = self
			.client
			.post(&self.endpoint)
			.json(request)
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() {
					ExecutorError::Timeout(Duration::ZERO)
				} else {
					ExecutorError::Network(e.to_string())
				}
			})?;

		let status = response.status();
		if !status.is_success() {
			return Err(ExecutorError::Network(format!(
				"executor returned HTTP {status}"
			)));
		}

		response
			.json::<ExecutionResponse>()
			.await
			.map_err(|e| ExecutorError::InvalidResponse(e.to_string()))
	}
}
