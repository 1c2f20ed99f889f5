use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Wire shape of a `router.register` / `router.unregister` message. Field names are
/// normative — they are produced by every application instance in the fleet and
/// cannot be renamed without a fleet-wide rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub tls_port: u16,
	pub uris: Vec<String>,
	#[serde(default)]
	pub tags: HashMap<String, String>,
	pub app: String,
	#[serde(default)]
	pub private_instance_id: String,
	#[serde(default)]
	pub private_instance_index: String,
	#[serde(default)]
	pub server_cert_domain_san: Option<String>,
	#[serde(default)]
	pub route_service_url: String,
	#[serde(default)]
	pub stale_threshold_in_seconds: Option<u64>,
	#[serde(default)]
	pub isolation_segment: String,
	#[serde(default)]
	pub protocol: Option<String>,
	#[serde(default)]
	pub endpoint_updated_at_ns: Option<u64>,
}

pub type UnregisterMessage = RegisterMessage;

/// Payload for `router.start`, published on boot/reconnect and in reply to
/// `router.greet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMessage {
	pub id: String,
	pub hosts: Vec<String>,
	pub minimum_register_interval_in_seconds: u64,
	pub prune_threshold_in_seconds: u64,
}
