//! Per-node health snapshots.
//!
//! Volatile, owned by the router instance: rolling counters, latency samples,
//! consecutive-failure streaks, and the last-success timestamp. The durable
//! node row is the ground truth for status; snapshots converge across worker
//! processes because every result report updates both.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Latency samples kept per node for percentile estimation.
const LATENCY_SAMPLES: usize = 64;

/// Consecutive failures that downgrade a node to DEGRADED.
const DEGRADE_STREAK: u32 = 3;

/// Derived health band for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
	/// Success rate at or above 0.85.
	Healthy,
	/// Success rate in [0.70, 0.85), or a failure streak in progress.
	Degraded,
	/// Success rate below 0.70, or manually downed.
	Offline,
}

/// Rolling health snapshot for one proxy node.
#[derive(Debug, Default)]
pub struct NodeHealth {
	total: u64,
	successful: u64,
	consecutive_failures: u32,
	latencies_ms: VecDeque<u64>,
	total_latency_ms: u64,
	last_success: Option<Instant>,
	/// Set when a ban signal (403/429) downed the node; cleared out-of-band.
	manually_down: bool,
}

impl NodeHealth {
	pub fn new() -> Self {
		Self::default()
	}

	/// Cumulative success rate; 1.0 before any observations.
	pub fn success_rate(&self) -> f64 {
		if self.total == 0 {
			1.0
		} else {
			self.successful as f64 / self.total as f64
		}
	}

	/// Health band derived from the cumulative success rate.
	pub fn state(&self) -> HealthState {
		if self.manually_down {
			return HealthState::Offline;
		}
		let rate = self.success_rate();
		if rate < 0.70 {
			HealthState::Offline
		} else if rate < 0.85 || self.consecutive_failures >= DEGRADE_STREAK {
			HealthState::Degraded
		} else {
			HealthState::Healthy
		}
	}

	pub fn record_success(&mut self, latency_ms: u64) {
		self.total += 1;
		self.successful += 1;
		self.consecutive_failures = 0;
		self.last_success = Some(Instant::now());
		self.push_latency(latency_ms);
	}

	pub fn record_failure(&mut self, latency_ms: Option<u64>) {
		self.total += 1;
		self.consecutive_failures = self.consecutive_failures.saturating_add(1);
		if let Some(latency_ms) = latency_ms {
			self.push_latency(latency_ms);
		}
	}

	pub fn mark_down(&mut self) {
		self.manually_down = true;
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}

	/// Whether the last success happened within `window`.
	pub fn succeeded_within(&self, window: Duration) -> bool {
		self.last_success.is_some_and(|at| at.elapsed() <= window)
	}

	/// p95 latency over the retained samples, if any were recorded.
	pub fn p95_latency_ms(&self) -> Option<u64> {
		if self.latencies_ms.is_empty() {
			return None;
		}
		let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
		sorted.sort_unstable();
		let rank = (sorted.len() * 95).div_ceil(100).max(1) - 1;
		Some(sorted[rank])
	}

	fn push_latency(&mut self, latency_ms: u64) {
		self.total_latency_ms += latency_ms;
		self.latencies_ms.push_back(latency_ms);
		if self.latencies_ms.len() > LATENCY_SAMPLES {
			self.latencies_ms.pop_front();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_node_is_healthy_with_full_rate() {
		let health = NodeHealth::new();
		assert_eq!(health.success_rate(), 1.0);
		assert_eq!(health.state(), HealthState::Healthy);
		assert_eq!(health.p95_latency_ms(), None);
	}

	#[test]
	fn state_bands_follow_cumulative_rate() {
		let mut health = NodeHealth::new();
		for _ in 0..80 {
			health.record_success(100);
		}
		for _ in 0..20 {
			health.record_failure(Some(100));
		}
		// 80/100 = 0.80.
		assert_eq!(health.state(), HealthState::Degraded);

		for _ in 0..40 {
			health.record_failure(Some(100));
		}
		// 80/140 < 0.70.
		assert_eq!(health.state(), HealthState::Offline);
	}

	#[test]
	fn failure_streak_degrades_despite_good_rate() {
		let mut health = NodeHealth::new();
		for _ in 0..100 {
			health.record_success(50);
		}
		health.record_failure(None);
		health.record_failure(None);
		assert_eq!(health.state(), HealthState::Healthy);
		health.record_failure(None);
		assert_eq!(health.consecutive_failures(), 3);
		assert_eq!(health.state(), HealthState::Degraded);

		health.record_success(50);
		assert_eq!(health.consecutive_failures(), 0);
		assert_eq!(health.state(), HealthState::Healthy);
	}

	#[test]
	fn ban_signal_downs_the_node() {
		let mut health = NodeHealth::new();
		health.record_success(50);
		health.mark_down();
		assert_eq!(health.state(), HealthState::Offline);
	}

	#[test]
	fn p95_tracks_the_tail() {
		let mut health = NodeHealth::new();
		for _ in 0..9 {
			health.record_success(100);
		}
		health.record_success(9000);
		// Nearest-rank p95 over 10 samples lands on the slowest one.
		assert_eq!(health.p95_latency_ms(), Some(9000));
	}
}
