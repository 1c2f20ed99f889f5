use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::endpoint::{Endpoint, EndpointIdentity};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
	#[error("endpoint {identity} has route_service_url {incoming:?}, but pool is already pinned to {existing:?}")]
	RouteServiceMismatch {
		identity: EndpointIdentity,
		incoming: String,
		existing: String,
	},
	#[error("endpoint {identity} has route_service_url {url:?}, which is not an https:// URL")]
	RouteServiceNotHttps { identity: EndpointIdentity, url: String },
}

struct PoolInner {
	endpoints: Vec<Arc<Endpoint>>,
	route_service_url: Option<String>,
	last_empty_at_nanos: Option<u64>,
}

/// The endpoints registered for one URI key. Invariants: no two endpoints share a
/// `(host, port)` identity, and at most one distinct `route_service_url` is in effect
/// for the whole pool at a time.
///
/// Readers (the iterator) take a cheap snapshot under the read lock and then walk it
/// lock-free; writers (register/unregister/prune) hold the write lock only long enough
/// to mutate the vector. The generation counter lets iterator handles detect that the
/// pool moved under them without holding a lock across `Next()` calls.
pub struct Pool {
	inner: RwLock<PoolInner>,
	generation: AtomicU64,
}

impl Pool {
	pub fn new() -> Self {
		Pool {
			inner: RwLock::new(PoolInner {
				endpoints: Vec::new(),
				route_service_url: None,
				last_empty_at_nanos: None,
			}),
			generation: AtomicU64::new(0),
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	/// A cheap clone of the current endpoint list plus the generation it was read at.
	pub fn snapshot(&self) -> (u64, Vec<Arc<Endpoint>>) {
		let inner = self.inner.read().expect("pool lock poisoned");
		(self.generation(), inner.endpoints.clone())
	}

	pub fn route_service_url(&self) -> Option<String> {
		self.inner.read().expect("pool lock poisoned").route_service_url.clone()
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("pool lock poisoned").endpoints.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// `true` once the pool has been empty for at least `grace` and is therefore
	/// eligible for reaping by the registry's sweep.
	pub fn is_reapable(&self, grace_nanos: u64, now_nanos: u64) -> bool {
		let inner = self.inner.read().expect("pool lock poisoned");
		if !inner.endpoints.is_empty() {
			return false;
		}
		match inner.last_empty_at_nanos {
			Some(at) => now_nanos.saturating_sub(at) >= grace_nanos,
			None => false,
		}
	}

	/// Registers `endpoint`, replacing any existing endpoint with the same identity if
	/// `Endpoint::should_replace_with` says the incoming registration is newer.
	pub fn register(&self, endpoint: Endpoint) -> Result<(), PoolError> {
		if let Some(incoming_rs) = &endpoint.route_service_url {
			if !incoming_rs.starts_with("https://") {
				return Err(PoolError::RouteServiceNotHttps {
					identity: endpoint.identity.clone(),
					url: incoming_rs.clone(),
				});
			}

			let inner = self.inner.read().expect("pool lock poisoned");
			if let Some(existing_rs) = &inner.route_service_url {
				if existing_rs != incoming_rs {
					return Err(PoolError::RouteServiceMismatch {
						identity: endpoint.identity.clone(),
						incoming: incoming_rs.clone(),
						existing: existing_rs.clone(),
					});
				}
			}
		}

		let mut inner = self.inner.write().expect("pool lock poisoned");
		if inner.route_service_url.is_none() {
			inner.route_service_url = endpoint.route_service_url.clone();
		}
		match inner
			.endpoints
			.iter()
			.position(|e| e.identity == endpoint.identity)
		{
			Some(idx) => {
				if inner.endpoints[idx].should_replace_with(&endpoint) {
					inner.endpoints[idx] = Arc::new(endpoint);
					self.generation.fetch_add(1, Ordering::Release);
				}
			}
			None => {
				inner.endpoints.push(Arc::new(endpoint));
				self.generation.fetch_add(1, Ordering::Release);
			}
		}
		Ok(())
	}

	pub fn unregister(&self, identity: &EndpointIdentity, now_nanos: u64) -> bool {
		let mut inner = self.inner.write().expect("pool lock poisoned");
		let before = inner.endpoints.len();
		inner.endpoints.retain(|e| &e.identity != identity);
		let removed = inner.endpoints.len() != before;
		if removed {
			self.generation.fetch_add(1, Ordering::Release);
			if inner.endpoints.is_empty() {
				inner.last_empty_at_nanos = Some(now_nanos);
				inner.route_service_url = None;
			}
		}
		removed
	}

	/// Drops endpoints whose effective staleness threshold has elapsed. Returns the
	/// number of endpoints removed.
	pub fn prune(&self, now_nanos: u64, default_stale_nanos: u64) -> usize {
		let mut inner = self.inner.write().expect("pool lock poisoned");
		let before = inner.endpoints.len();
		inner.endpoints.retain(|e| {
			let threshold = e
				.stale_threshold
				.map(|d| d.as_nanos() as u64)
				.unwrap_or(default_stale_nanos);
			now_nanos.saturating_sub(e.updated_at_nanos) < threshold
		});
		let removed = before - inner.endpoints.len();
		if removed > 0 {
			self.generation.fetch_add(1, Ordering::Release);
			if inner.endpoints.is_empty() {
				inner.last_empty_at_nanos = Some(now_nanos);
				inner.route_service_url = None;
			}
		}
		removed
	}
}

impl Default for Pool {
	fn default() -> Self {
		Self::new()
	}
}
