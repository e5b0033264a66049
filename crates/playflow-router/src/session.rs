//! Sticky session bindings.
//!
//! A caller-supplied session token pins a logical session to one proxy node
//! for a bounded lifetime. Bindings take precedence over scoring as long as
//! the bound node stays usable.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session-to-node bindings with a fixed TTL.
pub struct StickySessions {
	bindings: DashMap<String, (Uuid, Instant)>,
	ttl: Duration,
}

impl StickySessions {
	pub fn new(ttl: Duration) -> Self {
		Self {
			bindings: DashMap::new(),
			ttl,
		}
	}

	/// The bound node for a session, if the binding has not expired.
	///
	/// Expired bindings are removed on lookup.
	pub fn get(&self, session_id: &str) -> Option<Uuid> {
		let expired = match self.bindings.get(session_id) {
			Some(entry) => {
				let (node_id, bound_at) = *entry;
				if bound_at.elapsed() <= self.ttl {
					return Some(node_id);
				}
				true
			}
			None => false,
		};
		if expired {
			self.bindings.remove(session_id);
		}
		None
	}

	/// Binds (or re-binds) a session to a node, refreshing the TTL.
	pub fn bind(&self, session_id: &str, node_id: Uuid) {
		self.bindings
			.insert(session_id.to_string(), (node_id, Instant::now()));
	}

	/// Drops a binding, e.g. when the bound node went offline.
	pub fn unbind(&self, session_id: &str) {
		self.bindings.remove(session_id);
	}

	/// Removes expired bindings; returns how many were dropped.
	pub fn purge_expired(&self) -> usize {
		let before = self.bindings.len();
		self.bindings.retain(|_, (_, bound_at)| bound_at.elapsed() <= self.ttl);
		before - self.bindings.len()
	}
}
