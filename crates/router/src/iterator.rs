use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{Endpoint, EndpointIdentity, Pool};

/// Load-balancing policy a [`Pool`] is iterated under. Session affinity (the
/// `sticky` behavior) is layered on top of whichever policy is configured here via
/// [`EndpointIterator::new`]'s `sticky_instance_id` argument, rather than being a
/// third variant of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
	#[default]
	RoundRobin,
	LeastConnection,
}

/// Per-pool state the round-robin policy needs across requests. One of these lives
/// alongside each `Pool`; it is intentionally separate from `Pool` itself so that
/// adding load-balancing state never touches the registry's locking.
#[derive(Default)]
pub struct PoolCursor {
	next: AtomicUsize,
}

impl PoolCursor {
	pub fn new() -> Self {
		Self::default()
	}

	fn fetch_and_advance(&self, modulus: usize) -> usize {
		if modulus == 0 {
			return 0;
		}
		self.next.fetch_add(1, Ordering::Relaxed) % modulus
	}
}

/// The retry cursor for one request attempt. Walks a `Pool` snapshot under a load
/// balancing policy, remembering which endpoints have already failed so a retry never
/// revisits them, and optionally honouring a sticky session cookie on the first call.
pub struct EndpointIterator {
	policy: LoadBalancingPolicy,
	endpoints: Vec<Arc<Endpoint>>,
	failed: HashSet<EndpointIdentity>,
	sticky_instance_id: Option<String>,
	cursor: Arc<PoolCursor>,
	current: Option<Arc<Endpoint>>,
}

impl EndpointIterator {
	pub fn new(
		pool: &Pool,
		cursor: Arc<PoolCursor>,
		policy: LoadBalancingPolicy,
		sticky_instance_id: Option<String>,
	) -> Self {
		let (_gen, endpoints) = pool.snapshot();
		EndpointIterator {
			policy,
			endpoints,
			failed: HashSet::new(),
			sticky_instance_id,
			cursor,
			current: None,
		}
	}

	/// Restricts iteration to a single endpoint, for `X-CF-APP-INSTANCE` pinned
	/// requests. Returns `false` if no such instance exists in the snapshot.
	pub fn pin_to_instance(&mut self, private_instance_id: &str) -> bool {
		match self
			.endpoints
			.iter()
			.find(|e| e.private_instance_id == private_instance_id)
			.cloned()
		{
			Some(e) => {
				self.endpoints = vec![e];
				true
			}
			None => false,
		}
	}

	fn candidates(&self) -> Vec<&Arc<Endpoint>> {
		self
			.endpoints
			.iter()
			.filter(|e| !self.failed.contains(&e.identity))
			.collect()
	}

	/// Returns the next candidate endpoint, or `None` if every endpoint in the pool
	/// snapshot has already failed within this request.
	pub fn next(&mut self) -> Option<Arc<Endpoint>> {
		// Sticky session affinity only applies to the very first pick.
		if self.current.is_none() {
			if let Some(sticky_id) = self.sticky_instance_id.take() {
				if let Some(e) = self
					.endpoints
					.iter()
					.find(|e| e.private_instance_id == sticky_id && !self.failed.contains(&e.identity))
					.cloned()
				{
					self.current = Some(e.clone());
					return Some(e);
				}
			}
		}

		let candidates = self.candidates();
		if candidates.is_empty() {
			self.current = None;
			return None;
		}

		let chosen = match self.policy {
			LoadBalancingPolicy::RoundRobin => {
				let idx = self.cursor.fetch_and_advance(candidates.len());
				candidates[idx].clone()
			}
			LoadBalancingPolicy::LeastConnection => candidates
				.iter()
				.min_by_key(|e| e.stats.in_flight())
				.expect("candidates is non-empty")
				.to_owned()
				.clone(),
		};
		self.current = Some(chosen.clone());
		Some(chosen)
	}

	pub fn pre_request(&self) {
		if let Some(e) = &self.current {
			e.stats.pre_request();
		}
	}

	pub fn post_request(&self) {
		if let Some(e) = &self.current {
			e.stats.post_request();
		}
	}

	/// Marks the endpoint from the most recent `next()` call as failed for the
	/// remainder of this request, so a subsequent `next()` skips it. If
	/// `structurally_unreachable` is set the caller is also expected to unregister the
	/// endpoint from the pool.
	pub fn endpoint_failed(&mut self, structurally_unreachable: bool) {
		if let Some(e) = self.current.take() {
			e.stats.record_failure();
			self.failed.insert(e.identity.clone());
			let _ = structurally_unreachable; // caller handles registry-level pruning
		}
	}

	pub fn attempted(&self) -> usize {
		self.failed.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::endpoint::{ModificationTag, Protocol};
	use std::collections::HashMap;

	fn endpoint(port: u16) -> Endpoint {
		Endpoint {
			identity: EndpointIdentity { host: "10.0.0.1".into(), port },
			application_id: "app".into(),
			private_instance_id: format!("inst-{port}"),
			private_instance_index: "0".into(),
			tls: false,
			server_cert_domain_san: None,
			protocol: Protocol::Http1,
			tags: HashMap::new(),
			route_service_url: None,
			isolation_segment: String::new(),
			stale_threshold: None,
			updated_at_nanos: 0,
			modification_tag: ModificationTag::new("sender", 1),
			stats: Default::default(),
		}
	}

	#[test]
	fn retry_never_revisits_failed_endpoint() {
		let pool = Pool::new();
		pool.register(endpoint(8080)).unwrap();
		pool.register(endpoint(8081)).unwrap();
		let mut it = EndpointIterator::new(&pool, Arc::new(PoolCursor::new()), LoadBalancingPolicy::RoundRobin, None);

		let first = it.next().unwrap();
		it.endpoint_failed(false);
		let second = it.next().unwrap();
		assert_ne!(first.identity, second.identity);
		it.endpoint_failed(false);
		assert!(it.next().is_none());
	}

	#[test]
	fn sticky_session_wins_first_pick() {
		let pool = Pool::new();
		pool.register(endpoint(8080)).unwrap();
		pool.register(endpoint(8081)).unwrap();
		let mut it = EndpointIterator::new(
			&pool,
			Arc::new(PoolCursor::new()),
			LoadBalancingPolicy::RoundRobin,
			Some("inst-8081".to_string()),
		);
		let first = it.next().unwrap();
		assert_eq!(first.private_instance_id, "inst-8081");
	}

	#[test]
	fn least_connection_prefers_idle_endpoint() {
		let pool = Pool::new();
		pool.register(endpoint(8080)).unwrap();
		pool.register(endpoint(8081)).unwrap();
		let (_, endpoints) = pool.snapshot();
		endpoints[0].stats.pre_request();
		endpoints[0].stats.pre_request();

		let mut it = EndpointIterator::new(&pool, Arc::new(PoolCursor::new()), LoadBalancingPolicy::LeastConnection, None);
		let chosen = it.next().unwrap();
		assert_eq!(chosen.identity.port, 8081);
	}
}
