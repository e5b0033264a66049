//! Proxy node records shared across worker instances.
//!
//! The durable node row is the ground truth for status and load; the volatile
//! per-node health snapshot lives in the router and is rebuilt from result
//! reports after a restart.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proxy node class, ordered by expected quality/cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyTier {
	Datacenter,
	Isp,
	Residential,
	Mobile,
	Tor,
}

impl ProxyTier {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProxyTier::Datacenter => "DATACENTER",
			ProxyTier::Isp => "ISP",
			ProxyTier::Residential => "RESIDENTIAL",
			ProxyTier::Mobile => "MOBILE",
			ProxyTier::Tor => "TOR",
		}
	}

	/// Scoring multiplier expressing a small preference for cheaper tiers.
	pub fn cost_factor(&self) -> f64 {
		match self {
			ProxyTier::Datacenter => 1.05,
			ProxyTier::Isp => 1.02,
			ProxyTier::Residential => 1.0,
			ProxyTier::Mobile => 0.97,
			ProxyTier::Tor => 0.95,
		}
	}

	pub fn all() -> [ProxyTier; 5] {
		[
			ProxyTier::Datacenter,
			ProxyTier::Isp,
			ProxyTier::Residential,
			ProxyTier::Mobile,
			ProxyTier::Tor,
		]
	}
}

impl std::str::FromStr for ProxyTier {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"DATACENTER" => Ok(ProxyTier::Datacenter),
			"ISP" => Ok(ProxyTier::Isp),
			"RESIDENTIAL" => Ok(ProxyTier::Residential),
			"MOBILE" => Ok(ProxyTier::Mobile),
			"TOR" => Ok(ProxyTier::Tor),
			other => Err(format!("unknown proxy tier: {other}")),
		}
	}
}

impl std::fmt::Display for ProxyTier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Durable status of a proxy node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyNodeStatus {
	Online,
	Offline,
	Maintenance,
	Banned,
	RateLimited,
}

impl ProxyNodeStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProxyNodeStatus::Online => "ONLINE",
			ProxyNodeStatus::Offline => "OFFLINE",
			ProxyNodeStatus::Maintenance => "MAINTENANCE",
			ProxyNodeStatus::Banned => "BANNED",
			ProxyNodeStatus::RateLimited => "RATE_LIMITED",
		}
	}
}

impl std::str::FromStr for ProxyNodeStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ONLINE" => Ok(ProxyNodeStatus::Online),
			"OFFLINE" => Ok(ProxyNodeStatus::Offline),
			"MAINTENANCE" => Ok(ProxyNodeStatus::Maintenance),
			"BANNED" => Ok(ProxyNodeStatus::Banned),
			"RATE_LIMITED" => Ok(ProxyNodeStatus::RateLimited),
			other => Err(format!("unknown proxy node status: {other}")),
		}
	}
}

/// Credentials forwarded to the executor alongside a proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuth {
	pub username: String,
	pub password: String,
}

/// Durable proxy node record, shared across worker instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyNode {
	pub id: Uuid,
	/// host:port the executor connects through.
	pub endpoint: String,
	pub tier: ProxyTier,
	/// ISO country code, when the node is geo-pinned.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub country: Option<String>,
	/// Maximum concurrent leases.
	pub capacity: u32,
	/// Leases currently held; mutated only by conditional increments.
	pub current_load: u32,
	pub status: ProxyNodeStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub auth: Option<ProxyAuth>,
}

impl ProxyNode {
	/// Whether the node can accept another lease.
	pub fn has_capacity(&self) -> bool {
		self.current_load < self.capacity
	}
}
