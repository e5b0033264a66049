//! Proxy router for the playflow delivery engine.
//!
//! Supplies a proxy node for each delivery task and ingests result reports
//! for health tracking. Selection walks a tier fallback chain gated by
//! per-tier circuit breakers, scores store candidates against the in-memory
//! health snapshots, and picks among the best by weighted random so load
//! spreads while still favoring quality. Ban signals (403/429) offline the
//! node durably; failure streaks degrade it.

use dashmap::DashMap;
use playflow_store::{Store, StoreError, StoreInterface};
use playflow_types::{ProxyHandle, ProxyNode, ProxyNodeStatus, ProxyTier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod breaker;
pub mod health;
pub mod session;

use breaker::{BreakerState, CircuitBreaker};
use health::{HealthState, NodeHealth};
use session::StickySessions;

/// Freshness window for the last-success scoring bonus.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Errors that can occur during routing operations.
#[derive(Debug, Error)]
pub enum RouterError {
	/// Error from the durable store.
	#[error("Store error: {0}")]
	Store(#[from] StoreError),
}

/// The operation a route is requested for; determines tier preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	/// Bulk play delivery; cheap datacenter exits are fine.
	PlayDelivery,
	/// Account creation needs residential exits to survive screening.
	AccountCreation,
	/// Session warmup traffic, between the two.
	SessionWarmup,
}

impl Operation {
	pub fn preferred_tier(&self) -> ProxyTier {
		match self {
			Operation::PlayDelivery => ProxyTier::Datacenter,
			Operation::AccountCreation => ProxyTier::Residential,
			Operation::SessionWarmup => ProxyTier::Isp,
		}
	}
}

/// Tier fallback chain, preferred first. Chains descend toward cheaper tiers
/// so an open breaker sheds load downward rather than upward in cost.
fn fallback_chain(preferred: ProxyTier) -> &'static [ProxyTier] {
	match preferred {
		ProxyTier::Mobile => &[
			ProxyTier::Mobile,
			ProxyTier::Residential,
			ProxyTier::Isp,
			ProxyTier::Datacenter,
		],
		ProxyTier::Residential => &[ProxyTier::Residential, ProxyTier::Isp, ProxyTier::Datacenter],
		ProxyTier::Isp => &[ProxyTier::Isp, ProxyTier::Datacenter],
		ProxyTier::Datacenter => &[ProxyTier::Datacenter],
		ProxyTier::Tor => &[ProxyTier::Tor, ProxyTier::Datacenter],
	}
}

/// A routing request for one task.
#[derive(Debug, Clone)]
pub struct RouteRequest {
	pub operation: Operation,
	/// Geo pin, when the order requires one.
	pub country: Option<String>,
	pub quantity: u64,
	/// Sticky-session token; binds the session to one node for the TTL.
	pub session_id: Option<String>,
}

/// A leased proxy node. The lease holds one unit of the node's
/// `current_load`; release it through [`ProxyRouter::release`].
#[derive(Debug, Clone)]
pub struct ProxyLease {
	pub node: ProxyNode,
}

impl ProxyLease {
	/// The handle forwarded to the executor.
	pub fn handle(&self) -> ProxyHandle {
		ProxyHandle {
			node_id: self.node.id,
			endpoint: self.node.endpoint.clone(),
			auth: self.node.auth.clone(),
		}
	}
}

/// Router tuning knobs; the engine maps its configuration onto this.
#[derive(Debug, Clone)]
pub struct RouterOptions {
	pub enabled: bool,
	pub min_score: f64,
	pub select_candidates: usize,
	pub candidate_fetch: usize,
	pub sticky_ttl: Duration,
	pub breaker_window: Duration,
	pub breaker_open: Duration,
	pub breaker_success_threshold: u32,
	/// Per-tier failure thresholds feeding the breakers.
	pub tier_failure_thresholds: HashMap<ProxyTier, u32>,
}

impl Default for RouterOptions {
	fn default() -> Self {
		let mut tier_failure_thresholds = HashMap::new();
		tier_failure_thresholds.insert(ProxyTier::Mobile, 15);
		tier_failure_thresholds.insert(ProxyTier::Residential, 12);
		tier_failure_thresholds.insert(ProxyTier::Isp, 10);
		tier_failure_thresholds.insert(ProxyTier::Datacenter, 8);
		tier_failure_thresholds.insert(ProxyTier::Tor, 5);
		Self {
			enabled: true,
			min_score: 0.7,
			select_candidates: 3,
			candidate_fetch: 50,
			sticky_ttl: Duration::from_secs(1800),
			breaker_window: Duration::from_secs(60),
			breaker_open: Duration::from_secs(300),
			breaker_success_threshold: 3,
			tier_failure_thresholds,
		}
	}
}

/// Per-process proxy router.
///
/// Health snapshots are confined to this instance; the durable node row is
/// the shared ground truth. Result reports for the same node may arrive from
/// concurrent tasks, so snapshot updates fold through the map's per-key
/// locks.
pub struct ProxyRouter {
	store: Store,
	options: RouterOptions,
	health: DashMap<Uuid, NodeHealth>,
	breakers: DashMap<ProxyTier, CircuitBreaker>,
	sessions: StickySessions,
	rng: Mutex<StdRng>,
}

impl ProxyRouter {
	pub fn new(store: Store, options: RouterOptions) -> Self {
		let breakers = DashMap::new();
		for tier in ProxyTier::all() {
			let threshold = options
				.tier_failure_thresholds
				.get(&tier)
				.copied()
				.unwrap_or(8);
			breakers.insert(
				tier,
				CircuitBreaker::new(
					threshold,
					options.breaker_window,
					options.breaker_open,
					options.breaker_success_threshold,
				),
			);
		}
		let sessions = StickySessions::new(options.sticky_ttl);
		Self {
			store,
			options,
			health: DashMap::new(),
			breakers,
			sessions,
			rng: Mutex::new(StdRng::from_entropy()),
		}
	}

	/// Deterministic variant for tests.
	pub fn with_seed(store: Store, options: RouterOptions, seed: u64) -> Self {
		let router = Self::new(store, options);
		*router.rng.lock().expect("rng lock poisoned") = StdRng::seed_from_u64(seed);
		router
	}

	/// Selects and leases a node for the request, or yields "no proxy".
	pub async fn select(
		&self,
		request: &RouteRequest,
	) -> Result<Option<ProxyLease>, RouterError> {
		if !self.options.enabled {
			return Ok(None);
		}

		// Sticky binding takes precedence while the bound node stays usable.
		if let Some(session_id) = &request.session_id {
			if let Some(lease) = self.try_sticky(session_id).await? {
				return Ok(Some(lease));
			}
		}

		let chain = fallback_chain(request.operation.preferred_tier());
		let tier = self.pick_tier(chain);

		let candidates = self
			.store
			.list_candidates(tier, request.country.as_deref(), self.options.candidate_fetch)
			.await?;

		let mut scored: Vec<(ProxyNode, f64)> = candidates
			.into_iter()
			.map(|node| {
				let score = self.score(&node);
				(node, score)
			})
			.filter(|(_, score)| *score >= self.options.min_score)
			.collect();
		scored.sort_by(|a, b| b.1.total_cmp(&a.1));
		scored.truncate(self.options.select_candidates);

		// Weighted random over score squared; re-pick if the lease races to
		// a full node.
		while !scored.is_empty() {
			let index = self.weighted_pick(&scored);
			let (node, _) = scored.remove(index);
			if self.store.lease_node(node.id).await? {
				let degraded = self
					.health
					.get(&node.id)
					.is_some_and(|h| h.state() == HealthState::Degraded);
				if degraded {
					tracing::warn!(
						node_id = %node.id,
						tier = %node.tier,
						"Routing through degraded node"
					);
				}
				if let Some(session_id) = &request.session_id {
					self.sessions.bind(session_id, node.id);
				}
				return Ok(Some(ProxyLease { node }));
			}
		}
		Ok(None)
	}

	/// Releases a lease taken by [`select`](Self::select).
	pub async fn release(&self, node_id: Uuid) -> Result<(), RouterError> {
		self.store.release_node(node_id).await?;
		Ok(())
	}

	/// Ingests one execution result for health tracking.
	///
	/// A 403/429 error code offlines the node durably; three consecutive
	/// failures downgrade it. Every report also feeds the tier breaker.
	pub async fn report_result(
		&self,
		node_id: Uuid,
		tier: ProxyTier,
		success: bool,
		latency_ms: Option<u64>,
		error_code: Option<u16>,
	) -> Result<(), RouterError> {
		let bannable = !success && matches!(error_code, Some(403) | Some(429));
		let streak;
		{
			// Fold the report under the per-key lock; must not await here.
			let mut entry = self.health.entry(node_id).or_default();
			if success {
				entry.record_success(latency_ms.unwrap_or(0));
			} else {
				entry.record_failure(latency_ms);
			}
			if bannable {
				entry.mark_down();
			}
			streak = entry.consecutive_failures();
		}

		if bannable {
			tracing::warn!(
				node_id = %node_id,
				tier = %tier,
				error_code = ?error_code,
				"Proxy ban signal, taking node offline"
			);
			self.store
				.set_node_status(node_id, ProxyNodeStatus::Offline)
				.await?;
		} else if !success && streak == 3 {
			tracing::warn!(
				node_id = %node_id,
				tier = %tier,
				"Node downgraded after consecutive failures"
			);
		}

		if let Some(mut breaker) = self.breakers.get_mut(&tier) {
			if success {
				breaker.record_success();
			} else {
				breaker.record_failure();
			}
		}
		Ok(())
	}

	/// Current breaker state for a tier; admin/observability.
	pub fn breaker_state(&self, tier: ProxyTier) -> Option<BreakerState> {
		self.breakers.get(&tier).map(|b| b.state())
	}

	/// Drops expired sticky bindings; returns how many were dropped.
	pub fn purge_sessions(&self) -> usize {
		self.sessions.purge_expired()
	}

	async fn try_sticky(&self, session_id: &str) -> Result<Option<ProxyLease>, RouterError> {
		let Some(node_id) = self.sessions.get(session_id) else {
			return Ok(None);
		};
		match self.store.get_node(node_id).await {
			Ok(node) if node.status == ProxyNodeStatus::Online => {
				let downed = self
					.health
					.get(&node_id)
					.is_some_and(|h| h.state() == HealthState::Offline);
				if !downed && self.store.lease_node(node_id).await? {
					self.sessions.bind(session_id, node_id);
					return Ok(Some(ProxyLease { node }));
				}
			}
			Ok(_) | Err(StoreError::NotFound) => {}
			Err(e) => return Err(e.into()),
		}
		self.sessions.unbind(session_id);
		Ok(None)
	}

	/// First tier in the chain whose breaker admits a request; the minimum
	/// tier is the last resort even with an open breaker.
	fn pick_tier(&self, chain: &[ProxyTier]) -> ProxyTier {
		for &tier in chain {
			if let Some(mut breaker) = self.breakers.get_mut(&tier) {
				if breaker.allow_request() {
					return tier;
				}
			}
		}
		let last = *chain.last().expect("fallback chains are non-empty");
		tracing::warn!(tier = %last, "All tier breakers open, using minimum tier as last resort");
		last
	}

	fn score(&self, node: &ProxyNode) -> f64 {
		let default_health = NodeHealth::new();
		let entry = self.health.get(&node.id);
		let health = entry.as_deref().unwrap_or(&default_health);

		let mut score = health.success_rate();
		if let Some(p95) = health.p95_latency_ms() {
			if p95 > 5000 {
				score *= 0.5;
			} else if p95 > 2000 {
				score *= 0.8;
			}
		}
		let capacity = node.capacity.max(1) as f64;
		score *= 1.0 - 0.3 * (node.current_load as f64 / capacity);
		score *= node.tier.cost_factor();
		if health.succeeded_within(FRESHNESS_WINDOW) {
			score *= 1.1;
		}
		score
	}

	fn weighted_pick(&self, scored: &[(ProxyNode, f64)]) -> usize {
		let weights: Vec<f64> = scored.iter().map(|(_, s)| s * s).collect();
		let total: f64 = weights.iter().sum();
		if total <= 0.0 {
			return 0;
		}
		let mut rng = self.rng.lock().expect("rng lock poisoned");
		let mut roll = rng.gen_range(0.0..total);
		for (index, weight) in weights.iter().enumerate() {
			if roll < *weight {
				return index;
			}
			roll -= weight;
		}
		weights.len() - 1
	}
}
