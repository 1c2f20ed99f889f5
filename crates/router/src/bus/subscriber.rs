use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use super::{Bus, Message, RegisterMessage, StartMessage};
use crate::registry::Registry;
use crate::types::{Endpoint, EndpointIdentity};
use router_core::metrics::Metrics;

const REGISTER_SUBJECT: &str = "router.register";
const UNREGISTER_SUBJECT: &str = "router.unregister";
const START_SUBJECT: &str = "router.start";
const GREET_SUBJECT: &str = "router.greet";
const GREET_QUEUE_GROUP: &str = "router";

/// Applies `router.register`/`router.unregister` bus traffic to a [`Registry`], and
/// answers `router.greet` with the same payload it publishes on `router.start`.
///
/// Message handling is non-blocking by construction: `Registry::register` and
/// `Registry::unregister` only ever take a Pool's own short-lived lock, never I/O,
/// so a burst of bus traffic can't stall behind a slow handler.
pub struct Subscriber<B: Bus> {
	bus: Arc<B>,
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	router_id: String,
	hosts: Vec<String>,
	minimum_register_interval: Duration,
	prune_threshold: Duration,
	http2_enabled: bool,
}

impl<B: Bus + 'static> Subscriber<B> {
	pub fn new(
		bus: Arc<B>,
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		router_id: String,
		hosts: Vec<String>,
		minimum_register_interval: Duration,
		prune_threshold: Duration,
		http2_enabled: bool,
	) -> Self {
		Subscriber {
			bus,
			registry,
			metrics,
			router_id,
			hosts,
			minimum_register_interval,
			prune_threshold,
			http2_enabled,
		}
	}

	fn start_message(&self) -> StartMessage {
		StartMessage {
			id: self.router_id.clone(),
			hosts: self.hosts.clone(),
			minimum_register_interval_in_seconds: self.minimum_register_interval.as_secs(),
			prune_threshold_in_seconds: self.prune_threshold.as_secs(),
		}
	}

	async fn announce_start(&self) -> anyhow::Result<()> {
		let payload = serde_json::to_vec(&self.start_message())?;
		self.bus.publish(START_SUBJECT, payload.into()).await
	}

	/// Runs forever, consuming register/unregister/greet traffic. Intended to run on
	/// its own task; publishes the initial `router.start` announcement before
	/// entering the loop.
	pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
		self.announce_start().await?;

		let mut register = self.bus.subscribe(REGISTER_SUBJECT).await?;
		let mut unregister = self.bus.subscribe(UNREGISTER_SUBJECT).await?;
		let mut greet = self.bus.queue_subscribe(GREET_SUBJECT, GREET_QUEUE_GROUP).await?;

		loop {
			tokio::select! {
				Some(msg) = register.next() => self.handle_register(msg),
				Some(msg) = unregister.next() => self.handle_unregister(msg),
				Some(msg) = greet.next() => self.handle_greet(msg).await,
				else => return Ok(()),
			}
		}
	}

	fn handle_register(&self, msg: Message) {
		let parsed: RegisterMessage = match serde_json::from_slice(&msg.payload) {
			Ok(m) => m,
			Err(e) => {
				tracing::warn!(error = %e, "dropping malformed router.register message");
				self.metrics.inc_bus_invalid();
				return;
			}
		};

		if !parsed.route_service_url.is_empty() && !parsed.route_service_url.starts_with("https") {
			tracing::warn!(
				route_service_url = %parsed.route_service_url,
				"dropping register message with non-https route_service_url"
			);
			self.metrics.inc_bus_invalid();
			return;
		}

		let (port, tls) = if parsed.tls_port != 0 {
			(parsed.tls_port, true)
		} else {
			(parsed.port, false)
		};

		for uri in &parsed.uris {
			let endpoint = to_endpoint(&parsed, port, tls, self.http2_enabled);
			if let Err(e) = self.registry.register(uri, endpoint) {
				tracing::warn!(uri = %uri, error = %e, "rejected register message");
				self.metrics.inc_bus_invalid();
			}
		}
	}

	fn handle_unregister(&self, msg: Message) {
		let parsed: RegisterMessage = match serde_json::from_slice(&msg.payload) {
			Ok(m) => m,
			Err(e) => {
				tracing::warn!(error = %e, "dropping malformed router.unregister message");
				self.metrics.inc_bus_invalid();
				return;
			}
		};
		let port = if parsed.tls_port != 0 { parsed.tls_port } else { parsed.port };
		let identity = EndpointIdentity { host: parsed.host.clone(), port };
		let now = router_core::time::unix_nanos_now();
		for uri in &parsed.uris {
			self.registry.unregister(uri, &identity, now);
		}
	}

	async fn handle_greet(&self, msg: Message) {
		let reply_to = msg.reply_to.unwrap_or(msg.subject);
		let payload = match serde_json::to_vec(&self.start_message()) {
			Ok(p) => p,
			Err(_) => return,
		};
		if let Err(e) = self.bus.publish(&reply_to, payload.into()).await {
			tracing::warn!(error = %e, "failed to reply to router.greet");
		}
	}
}

fn to_endpoint(msg: &RegisterMessage, port: u16, tls: bool, http2_enabled: bool) -> Endpoint {
	use crate::types::endpoint::{EndpointStats, ModificationTag, Protocol};

	let updated_at_nanos = msg.endpoint_updated_at_ns.unwrap_or_else(router_core::time::unix_nanos_now);
	let modification_tag = ModificationTag::new(format!("{}:{}", msg.host, port), updated_at_nanos);

	Endpoint {
		identity: EndpointIdentity { host: msg.host.clone(), port },
		application_id: msg.app.clone(),
		private_instance_id: msg.private_instance_id.clone(),
		private_instance_index: msg.private_instance_index.clone(),
		tls,
		server_cert_domain_san: msg.server_cert_domain_san.clone(),
		protocol: msg
			.protocol
			.as_deref()
			.map(|p| Protocol::from_wire(p, http2_enabled))
			.unwrap_or_default(),
		tags: msg.tags.clone(),
		route_service_url: (!msg.route_service_url.is_empty()).then(|| msg.route_service_url.clone()),
		isolation_segment: msg.isolation_segment.clone(),
		stale_threshold: msg.stale_threshold_in_seconds.map(Duration::from_secs),
		updated_at_nanos,
		modification_tag,
		stats: EndpointStats::default(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::Message;
	use std::sync::Mutex;
	use futures_util::stream::{self, BoxStream};

	struct FakeBus {
		published: Mutex<Vec<(String, Vec<u8>)>>,
	}

	#[async_trait::async_trait]
	impl Bus for FakeBus {
		async fn publish(&self, subject: &str, payload: bytes::Bytes) -> anyhow::Result<()> {
			self.published.lock().unwrap().push((subject.to_string(), payload.to_vec()));
			Ok(())
		}
		async fn subscribe(&self, _subject: &str) -> anyhow::Result<BoxStream<'static, Message>> {
			Ok(Box::pin(stream::empty()))
		}
		async fn queue_subscribe(&self, _subject: &str, _queue_group: &str) -> anyhow::Result<BoxStream<'static, Message>> {
			Ok(Box::pin(stream::empty()))
		}
	}

	fn registry() -> Arc<Registry> {
		Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(30)))
	}

	#[tokio::test]
	async fn register_then_unregister_applies_to_registry() {
		let bus = Arc::new(FakeBus { published: Mutex::new(Vec::new()) });
		let reg = registry();
		let sub = Subscriber::new(
			bus,
			reg.clone(),
			Arc::new(Metrics::new()),
			"router-1".into(),
			vec!["router-1.internal".into()],
			Duration::from_secs(20),
			Duration::from_secs(120),
			true,
		);

		let msg = RegisterMessage {
			host: "10.0.0.1".into(),
			port: 8080,
			tls_port: 0,
			uris: vec!["app.x".into()],
			tags: Default::default(),
			app: "app-a".into(),
			private_instance_id: "inst-0".into(),
			private_instance_index: "0".into(),
			server_cert_domain_san: None,
			route_service_url: String::new(),
			stale_threshold_in_seconds: None,
			isolation_segment: String::new(),
			protocol: None,
			endpoint_updated_at_ns: Some(1),
		};
		let payload = serde_json::to_vec(&msg).unwrap();
		sub.handle_register(Message { subject: REGISTER_SUBJECT.into(), payload: payload.into(), reply_to: None });

		let pool = reg.lookup("app.x", "/").unwrap();
		assert_eq!(pool.len(), 1);

		let payload = serde_json::to_vec(&msg).unwrap();
		sub.handle_unregister(Message { subject: UNREGISTER_SUBJECT.into(), payload: payload.into(), reply_to: None });
		assert!(reg.lookup("app.x", "/").is_none());
	}

	#[tokio::test]
	async fn register_rejects_non_https_route_service_url() {
		let bus = Arc::new(FakeBus { published: Mutex::new(Vec::new()) });
		let reg = registry();
		let sub = Subscriber::new(
			bus,
			reg.clone(),
			Arc::new(Metrics::new()),
			"router-1".into(),
			vec![],
			Duration::from_secs(20),
			Duration::from_secs(120),
			true,
		);
		let msg = RegisterMessage {
			host: "10.0.0.1".into(),
			port: 8080,
			tls_port: 0,
			uris: vec!["app.x".into()],
			tags: Default::default(),
			app: "app-a".into(),
			private_instance_id: "inst-0".into(),
			private_instance_index: "0".into(),
			server_cert_domain_san: None,
			route_service_url: "http://insecure".into(),
			stale_threshold_in_seconds: None,
			isolation_segment: String::new(),
			protocol: None,
			endpoint_updated_at_ns: Some(1),
		};
		let payload = serde_json::to_vec(&msg).unwrap();
		sub.handle_register(Message { subject: REGISTER_SUBJECT.into(), payload: payload.into(), reply_to: None });
		assert!(reg.lookup("app.x", "/").is_none());
	}
}
