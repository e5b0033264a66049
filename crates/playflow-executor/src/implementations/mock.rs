//! Mock executor backend with failure injection.
//!
//! Used by development and test environments: delivers instantly by default,
//! and exposes toggles to inject failure percentages, simulated timeouts,
//! added latency, per-node bans (answered as 429), and a global pause. The
//! toggles are shared through a handle so the admin surface can flip them at
//! runtime.

use crate::{ExecutorError, ExecutorInterface};
use async_trait::async_trait;
use playflow_types::{ExecutionRequest, ExecutionResponse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Runtime-tunable failure injection settings.
#[derive(Debug, Clone, Default)]
pub struct InjectionSettings {
	/// Percentage of calls answered with a transient failure, 0..=100.
	pub fail_percent: u8,
	/// Simulate a hung executor: calls sleep until the caller's timeout fires.
	pub simulate_timeout: bool,
	/// Extra latency added to every call.
	pub added_latency: Duration,
	/// Nodes answered with 429 regardless of the failure roll.
	pub banned_nodes: HashSet<Uuid>,
	/// Answer every call with a transient failure while set.
	pub paused: bool,
}

/// Shared handle to the injection settings.
///
/// Cloned into the admin surface; the executor reads through the same lock.
#[derive(Clone, Default)]
pub struct InjectionHandle {
	settings: Arc<RwLock<InjectionSettings>>,
}

impl InjectionHandle {
	pub fn snapshot(&self) -> InjectionSettings {
		self.settings.read().expect("injection lock poisoned").clone()
	}

	pub fn update(&self, apply: impl FnOnce(&mut InjectionSettings)) {
		let mut settings = self.settings.write().expect("injection lock poisoned");
		apply(&mut settings);
	}

	pub fn ban_node(&self, node_id: Uuid) {
		self.update(|s| {
			s.banned_nodes.insert(node_id);
		});
	}

	pub fn unban_node(&self, node_id: Uuid) {
		self.update(|s| {
			s.banned_nodes.remove(&node_id);
		});
	}
}

/// Mock executor implementation.
pub struct MockExecutor {
	handle: InjectionHandle,
	rng: Mutex<StdRng>,
	/// Simulated per-call latency reported back in responses.
	base_latency_ms: u64,
}

impl MockExecutor {
	pub fn new(handle: InjectionHandle) -> Self {
		Self {
			handle,
			rng: Mutex::new(StdRng::from_entropy()),
			base_latency_ms: 25,
		}
	}

	/// Deterministic variant for tests.
	pub fn with_seed(handle: InjectionHandle, seed: u64) -> Self {
		Self {
			handle,
			rng: Mutex::new(StdRng::seed_from_u64(seed)),
			base_latency_ms: 25,
		}
	}

	fn roll_failure(&self, fail_percent: u8) -> bool {
		if fail_percent == 0 {
			return false;
		}
		let mut rng = self.rng.lock().expect("rng lock poisoned");
		rng.gen_range(0..100) < fail_percent as u32
	}
}

#[async_trait]
impl ExecutorInterface for MockExecutor {
	async fn execute(
		&self,
		request: &ExecutionRequest,
	) -> Result<ExecutionResponse, ExecutorError> {
		let settings = self.handle.snapshot();

		if settings.simulate_timeout {
			// Outlive any realistic call timeout; the service cancels us.
			tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
		}
		if !settings.added_latency.is_zero() {
			tokio::time::sleep(settings.added_latency).await;
		}

		if settings.banned_nodes.contains(&request.proxy.node_id) {
			return Ok(ExecutionResponse {
				success: false,
				plays_delivered: 0,
				error_code: Some(429),
				message: Some("rate limited".into()),
				latency_ms: self.base_latency_ms,
			});
		}

		if settings.paused {
			return Ok(ExecutionResponse {
				success: false,
				plays_delivered: 0,
				error_code: Some(503),
				message: Some("executor paused".into()),
				latency_ms: self.base_latency_ms,
			});
		}

		if self.roll_failure(settings.fail_percent) {
			return Ok(ExecutionResponse {
				success: false,
				plays_delivered: 0,
				error_code: Some(500),
				message: Some("injected failure".into()),
				latency_ms: self.base_latency_ms,
			});
		}

		Ok(ExecutionResponse {
			success: true,
			plays_delivered: request.quantity,
			error_code: None,
			message: None,
			latency_ms: self.base_latency_ms,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use playflow_types::ProxyHandle;

	fn request(node_id: Uuid) -> ExecutionRequest {
		ExecutionRequest {
			task_id: Uuid::new_v4(),
			order_id: Uuid::new_v4(),
			quantity: 500,
			target_url: "https://example.com".into(),
			proxy: ProxyHandle {
				node_id,
				endpoint: "10.0.0.1:8080".into(),
				auth: None,
			},
		}
	}

	#[tokio::test]
	async fn delivers_full_quantity_by_default() {
		let executor = MockExecutor::with_seed(InjectionHandle::default(), 7);
		let response = executor.execute(&request(Uuid::new_v4())).await.unwrap();
		assert!(response.success);
		assert_eq!(response.plays_delivered, 500);
	}

	#[tokio::test]
	async fn banned_nodes_answer_with_429() {
		let handle = InjectionHandle::default();
		let node = Uuid::new_v4();
		handle.ban_node(node);
		let executor = MockExecutor::with_seed(handle.clone(), 7);

		let response = executor.execute(&request(node)).await.unwrap();
		assert!(response.is_proxy_bannable());

		handle.unban_node(node);
		let response = executor.execute(&request(node)).await.unwrap();
		assert!(response.success);
	}

	#[tokio::test]
	async fn full_failure_injection_always_fails() {
		let handle = InjectionHandle::default();
		handle.update(|s| s.fail_percent = 100);
		let executor = MockExecutor::with_seed(handle, 7);

		for _ in 0..10 {
			let response = executor.execute(&request(Uuid::new_v4())).await.unwrap();
			assert!(!response.success);
			assert_eq!(response.error_code, Some(500));
		}
	}

	#[tokio::test]
	async fn pause_fails_transiently() {
		let handle = InjectionHandle::default();
		handle.update(|s| s.paused = true);
		let executor = MockExecutor::with_seed(handle.clone(), 7);
		let response = executor.execute(&request(Uuid::new_v4())).await.unwrap();
		assert!(!response.success);
		assert!(!response.is_proxy_bannable());

		handle.update(|s| s.paused = false);
		let response = executor.execute(&request(Uuid::new_v4())).await.unwrap();
		assert!(response.success);
	}
}
