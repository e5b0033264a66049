//! Request/response contract for the external proxy executor.
//!
//! The engine only consumes this contract; the executor that performs the
//! physical delivery is an external collaborator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proxy::ProxyAuth;

/// The proxy a delivery attempt is routed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHandle {
	#[serde(rename = "nodeId")]
	pub node_id: Uuid,
	pub endpoint: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auth: Option<ProxyAuth>,
}

/// A single delivery attempt handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
	#[serde(rename = "taskId")]
	pub task_id: Uuid,
	#[serde(rename = "orderId")]
	pub order_id: Uuid,
	pub quantity: u64,
	#[serde(rename = "targetUrl")]
	pub target_url: String,
	pub proxy: ProxyHandle,
}

/// Executor verdict for one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
	pub success: bool,
	#[serde(rename = "playsDelivered")]
	pub plays_delivered: u64,
	/// HTTP-style error code when the attempt failed.
	#[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
	pub error_code: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(rename = "latencyMs")]
	pub latency_ms: u64,
}

impl ExecutionResponse {
	/// Whether this failure indicates a banned or rate-limited proxy.
	///
	/// A 403/429 response obligates the router to offline the node.
	pub fn is_proxy_bannable(&self) -> bool {
		!self.success && matches!(self.error_code, Some(403) | Some(429))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bannable_codes() {
		let mut resp = ExecutionResponse {
			success: false,
			plays_delivered: 0,
			error_code: Some(429),
			message: None,
			latency_ms: 12,
		};
		assert!(resp.is_proxy_bannable());
		resp.error_code = Some(403);
		assert!(resp.is_proxy_bannable());
		resp.error_code = Some(500);
		assert!(!resp.is_proxy_bannable());
		resp.success = true;
		resp.error_code = Some(429);
		assert!(!resp.is_proxy_bannable());
	}
}
