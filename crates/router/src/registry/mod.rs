mod key;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

pub use key::RouteKey;

use crate::types::{Endpoint, EndpointIdentity, Pool};

/// Process-wide map from routable URI key to the [`Pool`] serving it.
///
/// A single reader-writer lock guards the map itself; each `Pool` has its own internal
/// lock, so a `Register`/`Unregister` against one key never blocks a `Lookup` against
/// another, and `Lookup` never blocks on Pool internals at all beyond the Pool's own
/// (short) read lock.
pub struct Registry {
	pools: RwLock<HashMap<RouteKey, Arc<Pool>>>,
	default_stale: std::time::Duration,
	drop_grace: std::time::Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error(transparent)]
	Pool(#[from] crate::types::pool::PoolError),
}

impl Registry {
	pub fn new(default_stale: std::time::Duration, drop_grace: std::time::Duration) -> Self {
		Registry {
			pools: RwLock::new(HashMap::new()),
			default_stale,
			drop_grace,
		}
	}

	/// Registers `endpoint` under `uri`, creating the pool if this is the first
	/// endpoint seen for it.
	pub fn register(&self, uri: &str, endpoint: Endpoint) -> Result<(), RegistryError> {
		let key = RouteKey::parse(uri);
		let pool = self.pool_or_create(key);
		pool.register(endpoint)?;
		Ok(())
	}

	pub fn unregister(&self, uri: &str, identity: &EndpointIdentity, now_nanos: u64) {
		let key = RouteKey::parse(uri);
		let pool = {
			let pools = self.pools.read().expect("registry lock poisoned");
			pools.get(&key).cloned()
		};
		if let Some(pool) = pool {
			pool.unregister(identity, now_nanos);
		}
	}

	/// Longest-prefix lookup: tries the full host+path key, then walks up path
	/// components until a registered pool is found.
	pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Pool>> {
		let host = RouteKey::normalize_host(host);
		let pools = self.pools.read().expect("registry lock poisoned");
		for candidate in RouteKey::candidates(&host, path) {
			if let Some(pool) = pools.get(&candidate) {
				return Some(pool.clone());
			}
		}
		None
	}

	/// Visits every `(key, pool)` pair under the read lock. Used for diagnostics and
	/// for the `router.greet` reply's host enumeration; callers must not block.
	pub fn each(&self, mut visit: impl FnMut(&RouteKey, &Arc<Pool>)) {
		let pools = self.pools.read().expect("registry lock poisoned");
		for (key, pool) in pools.iter() {
			visit(key, pool);
		}
	}

	pub fn len(&self) -> usize {
		self.pools.read().expect("registry lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops stale endpoints pool-by-pool, then reaps pools that have been empty for
	/// longer than `drop_grace`.
	pub fn prune(&self, now_nanos: u64) {
		let default_stale_nanos = self.default_stale.as_nanos() as u64;
		let drop_grace_nanos = self.drop_grace.as_nanos() as u64;

		let snapshot: Vec<(RouteKey, Arc<Pool>)> = {
			let pools = self.pools.read().expect("registry lock poisoned");
			pools.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
		};
		for (_, pool) in &snapshot {
			pool.prune(now_nanos, default_stale_nanos);
		}

		let mut pools = self.pools.write().expect("registry lock poisoned");
		pools.retain(|_, pool| !pool.is_reapable(drop_grace_nanos, now_nanos));
	}

	fn pool_or_create(&self, key: RouteKey) -> Arc<Pool> {
		{
			let pools = self.pools.read().expect("registry lock poisoned");
			if let Some(pool) = pools.get(&key) {
				return pool.clone();
			}
		}
		let mut pools = self.pools.write().expect("registry lock poisoned");
		pools
			.entry(key)
			.or_insert_with(|| Arc::new(Pool::new()))
			.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::endpoint::{ModificationTag, Protocol};
	use std::collections::HashMap as StdHashMap;
	use std::time::Duration;

	fn endpoint(host: &str, port: u16) -> Endpoint {
		Endpoint {
			identity: EndpointIdentity { host: host.into(), port },
			application_id: "app".into(),
			private_instance_id: "inst-0".into(),
			private_instance_index: "0".into(),
			tls: false,
			server_cert_domain_san: None,
			protocol: Protocol::Http1,
			tags: StdHashMap::new(),
			route_service_url: None,
			isolation_segment: String::new(),
			stale_threshold: None,
			updated_at_nanos: 0,
			modification_tag: ModificationTag::new("sender", 1),
			stats: Default::default(),
		}
	}

	#[test]
	fn register_then_lookup_round_trips() {
		let reg = Registry::new(Duration::from_secs(120), Duration::from_secs(60));
		reg.register("app.example.com", endpoint("10.0.0.1", 8080)).unwrap();
		let pool = reg.lookup("app.example.com", "/").expect("pool present");
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn lookup_is_case_and_port_insensitive_on_host() {
		let reg = Registry::new(Duration::from_secs(120), Duration::from_secs(60));
		reg.register("App.Example.com", endpoint("10.0.0.1", 8080)).unwrap();
		let pool = reg.lookup("app.example.com:443", "/").expect("pool present");
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn longest_prefix_path_wins() {
		let reg = Registry::new(Duration::from_secs(120), Duration::from_secs(60));
		reg.register("app.x", endpoint("10.0.0.1", 8080)).unwrap();
		reg.register("app.x/api", endpoint("10.0.0.2", 8080)).unwrap();
		let pool = reg.lookup("app.x", "/api/v1/widgets").expect("pool present");
		assert_eq!(pool.len(), 1);
		let endpoints = pool.snapshot().1;
		assert_eq!(endpoints[0].identity.host, "10.0.0.2");
	}

	#[test]
	fn unregister_then_prune_reaps_empty_pool() {
		let reg = Registry::new(Duration::from_secs(120), Duration::from_secs(0));
		reg.register("app.x", endpoint("10.0.0.1", 8080)).unwrap();
		reg.unregister("app.x", &EndpointIdentity { host: "10.0.0.1".into(), port: 8080 }, 1_000);
		assert_eq!(reg.len(), 1);
		reg.prune(2_000);
		assert_eq!(reg.len(), 0);
	}

	#[test]
	fn prune_never_removes_fresh_endpoints() {
		let reg = Registry::new(Duration::from_millis(100), Duration::from_secs(60));
		let mut e = endpoint("10.0.0.1", 8080);
		e.updated_at_nanos = 1_000_000_000; // 1s
		reg.register("app.x", e).unwrap();
		reg.prune(1_000_000_050); // 50ns later, well within the 100ms threshold
		let pool = reg.lookup("app.x", "/").unwrap();
		assert_eq!(pool.len(), 1);
	}
}
