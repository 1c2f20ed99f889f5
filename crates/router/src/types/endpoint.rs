use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// `(host, port)` — the only thing that makes two registrations "the same backend".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointIdentity {
	pub host: String,
	pub port: u16,
}

impl std::fmt::Display for EndpointIdentity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Orders concurrent registrations for one identity so a stale, out-of-order
/// `router.register` message can never clobber a newer one.
///
/// `guid` identifies the registering process (the sender of the bus message); `index`
/// is a per-sender monotone counter. Two tags are compared lexicographically on
/// `(index, guid)` — callers only ever compare tags carrying the same guid in practice,
/// but ties across different senders fall back to string order so the comparison is
/// total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModificationTag {
	pub index: u64,
	pub guid: String,
}

impl ModificationTag {
	pub const ZERO: ModificationTag = ModificationTag { index: 0, guid: String::new() };

	pub fn new(guid: impl Into<String>, index: u64) -> Self {
		Self { index, guid: guid.into() }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
	#[default]
	Http1,
	Http2,
}

impl Protocol {
	pub fn from_wire(s: &str, http2_enabled: bool) -> Self {
		match s {
			"http2" if http2_enabled => Protocol::Http2,
			_ => Protocol::Http1,
		}
	}
}

#[derive(Debug, Default)]
pub struct EndpointStats {
	pub in_flight: AtomicU64,
	pub total: AtomicU64,
	pub failed: AtomicU64,
}

impl EndpointStats {
	pub fn pre_request(&self) {
		self.in_flight.fetch_add(1, Ordering::Relaxed);
		self.total.fetch_add(1, Ordering::Relaxed);
	}

	pub fn post_request(&self) {
		self.in_flight.fetch_sub(1, Ordering::Relaxed);
	}

	pub fn record_failure(&self) {
		self.failed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn in_flight(&self) -> u64 {
		self.in_flight.load(Ordering::Relaxed)
	}
}

/// One reachable backend instance, as registered over the bus.
#[derive(Debug)]
pub struct Endpoint {
	pub identity: EndpointIdentity,
	pub application_id: String,
	pub private_instance_id: String,
	pub private_instance_index: String,
	pub tls: bool,
	pub server_cert_domain_san: Option<String>,
	pub protocol: Protocol,
	pub tags: HashMap<String, String>,
	pub route_service_url: Option<String>,
	pub isolation_segment: String,
	pub stale_threshold: Option<std::time::Duration>,
	pub updated_at_nanos: u64,
	pub modification_tag: ModificationTag,
	pub stats: EndpointStats,
}

impl Endpoint {
	pub fn identity(&self) -> &EndpointIdentity {
		&self.identity
	}

	pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
		format!("{}:{}", self.identity.host, self.identity.port)
			.parse()
			.map_err(|e| anyhow::anyhow!("endpoint {} has no resolvable socket address: {e}", self.identity))
	}

	/// `true` if `incoming` should replace `self` in the registry: either a strictly
	/// newer modification tag, or an equal tag with a newer timestamp (a duplicate
	/// re-register refreshing staleness).
	pub fn should_replace_with(&self, incoming: &Endpoint) -> bool {
		match incoming.modification_tag.cmp(&self.modification_tag) {
			std::cmp::Ordering::Greater => true,
			std::cmp::Ordering::Equal => incoming.updated_at_nanos >= self.updated_at_nanos,
			std::cmp::Ordering::Less => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn endpoint(tag: u64, updated_at: u64) -> Endpoint {
		Endpoint {
			identity: EndpointIdentity { host: "10.0.0.1".into(), port: 8080 },
			application_id: "app".into(),
			private_instance_id: "inst-1".into(),
			private_instance_index: "0".into(),
			tls: false,
			server_cert_domain_san: None,
			protocol: Protocol::Http1,
			tags: HashMap::new(),
			route_service_url: None,
			isolation_segment: String::new(),
			stale_threshold: None,
			updated_at_nanos: updated_at,
			modification_tag: ModificationTag::new("sender-a", tag),
			stats: EndpointStats::default(),
		}
	}

	#[test]
	fn newer_tag_replaces_older() {
		let old = endpoint(1, 100);
		let new = endpoint(2, 50);
		assert!(old.should_replace_with(&new));
	}

	#[test]
	fn older_tag_never_replaces() {
		let old = endpoint(5, 100);
		let stale = endpoint(1, 200);
		assert!(!old.should_replace_with(&stale));
	}

	#[test]
	fn equal_tag_refreshes_on_newer_timestamp() {
		let old = endpoint(3, 100);
		let refresh = endpoint(3, 150);
		assert!(old.should_replace_with(&refresh));
	}
}
