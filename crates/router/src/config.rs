use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::routeservice;

fn default_true() -> bool {
	true
}

fn default_max_attempts() -> u32 {
	3
}

fn default_max_request_size() -> u64 {
	16 * 1024 * 1024
}

fn default_stale_threshold() -> String {
	"120s".to_string()
}

fn default_drop_grace() -> String {
	"30s".to_string()
}

fn default_route_service_timeout() -> String {
	"60s".to_string()
}

fn default_lb_health_check_user_agent() -> String {
	"HTTP-Monitor/1.1".to_string()
}

fn default_sticky_session_cookie() -> String {
	"__VCAP_ID__".to_string()
}

/// Client-certificate forwarding policy for the XFCC pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XfccPolicy {
	AlwaysForward,
	Forward,
	SanitizeSet,
}

impl Default for XfccPolicy {
	fn default() -> Self {
		XfccPolicy::SanitizeSet
	}
}

/// On-disk / env-overridable configuration shape. Deliberately rejects unknown fields
/// so a typo in an operator's YAML fails fast at startup rather than silently no-op'ing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub listen_addr: SocketAddr,
	#[serde(default)]
	pub https_listen_addr: Option<SocketAddr>,
	#[serde(default)]
	pub health_listen_addr: Option<SocketAddr>,

	#[serde(default = "default_stale_threshold")]
	pub stale_threshold: String,
	#[serde(default = "default_drop_grace")]
	pub drop_grace: String,
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_max_request_size")]
	pub max_request_size: u64,

	#[serde(default)]
	pub route_services_enabled: bool,
	#[serde(default = "default_route_service_timeout")]
	pub route_service_timeout: String,
	#[serde(default)]
	pub route_service_current_key_hex: Option<String>,
	#[serde(default)]
	pub route_service_previous_key_hex: Option<String>,

	#[serde(default = "default_true")]
	pub http2_enabled: bool,
	#[serde(default)]
	pub xfcc_policy: XfccPolicy,
	#[serde(default)]
	pub trace_key: Option<String>,
	#[serde(default = "default_lb_health_check_user_agent")]
	pub load_balancer_health_check_user_agent: String,
	#[serde(default)]
	pub load_balancing_policy: crate::iterator::LoadBalancingPolicy,
	#[serde(default = "default_sticky_session_cookie")]
	pub sticky_session_cookie: String,

	#[serde(default)]
	pub nats_urls: Vec<String>,
	#[serde(default = "default_bus_buffer_size")]
	pub bus_message_buffer_size: usize,

	#[serde(default)]
	pub log_filter: String,
	#[serde(default)]
	pub log_json: bool,

	/// Extra PEM-encoded CA certificates to trust for backend TLS, on top of the
	/// platform root store — e.g. an internal CA signing a route service's cert.
	#[serde(default)]
	pub extra_ca_certs_path: Option<std::path::PathBuf>,
}

fn default_bus_buffer_size() -> usize {
	4096
}

/// The resolved configuration the rest of the process is built from. Durations are
/// parsed once here so the request path never touches a string.
#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub https_listen_addr: Option<SocketAddr>,
	pub health_listen_addr: Option<SocketAddr>,

	pub stale_threshold: Duration,
	pub drop_grace: Duration,
	pub max_attempts: u32,
	pub max_request_size: u64,

	pub route_services_enabled: bool,
	pub route_service_timeout: Duration,
	pub route_service_current_key: Option<routeservice::Key>,
	pub route_service_previous_key: Option<routeservice::Key>,

	pub http2_enabled: bool,
	pub xfcc_policy: XfccPolicy,
	pub trace_key: Option<String>,
	pub load_balancer_health_check_user_agent: String,
	pub load_balancing_policy: crate::iterator::LoadBalancingPolicy,
	pub sticky_session_cookie: String,

	pub nats_urls: Vec<String>,
	pub bus_message_buffer_size: usize,

	pub log_filter: String,
	pub log_json: bool,

	pub extra_ca_certs_path: Option<std::path::PathBuf>,
}

impl TryFrom<RawConfig> for Config {
	type Error = anyhow::Error;

	fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
		if raw.route_services_enabled && raw.route_service_current_key_hex.is_none() {
			anyhow::bail!("routeServicesEnabled requires routeServiceCurrentKeyHex to be set");
		}
		Ok(Config {
			listen_addr: raw.listen_addr,
			https_listen_addr: raw.https_listen_addr,
			health_listen_addr: raw.health_listen_addr,
			stale_threshold: router_core::duration::parse(&raw.stale_threshold)?,
			drop_grace: router_core::duration::parse(&raw.drop_grace)?,
			max_attempts: raw.max_attempts,
			max_request_size: raw.max_request_size,
			route_services_enabled: raw.route_services_enabled,
			route_service_timeout: router_core::duration::parse(&raw.route_service_timeout)?,
			route_service_current_key: raw
				.route_service_current_key_hex
				.as_deref()
				.map(routeservice::Key::from_hex)
				.transpose()?,
			route_service_previous_key: raw
				.route_service_previous_key_hex
				.as_deref()
				.map(routeservice::Key::from_hex)
				.transpose()?,
			http2_enabled: raw.http2_enabled,
			xfcc_policy: raw.xfcc_policy,
			trace_key: raw.trace_key,
			load_balancer_health_check_user_agent: raw.load_balancer_health_check_user_agent,
			load_balancing_policy: raw.load_balancing_policy,
			sticky_session_cookie: raw.sticky_session_cookie,
			nats_urls: raw.nats_urls,
			bus_message_buffer_size: raw.bus_message_buffer_size,
			log_filter: raw.log_filter,
			log_json: raw.log_json,
			extra_ca_certs_path: raw.extra_ca_certs_path,
		})
	}
}

impl Config {
	pub fn load_from_str(yaml: &str) -> anyhow::Result<Config> {
		let raw: RawConfig = serde_yaml::from_str(yaml)?;
		raw.try_into()
	}

	pub async fn load_from_file(path: &std::path::Path) -> anyhow::Result<Config> {
		let contents = fs_err::tokio::read_to_string(path).await?;
		Self::load_from_str(&contents)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_config_fills_defaults() {
		let cfg = Config::load_from_str("listenAddr: \"0.0.0.0:8080\"\n").unwrap();
		assert_eq!(cfg.max_attempts, 3);
		assert_eq!(cfg.stale_threshold, Duration::from_secs(120));
		assert_eq!(cfg.xfcc_policy, XfccPolicy::SanitizeSet);
	}

	#[test]
	fn route_services_enabled_requires_key() {
		let err = Config::load_from_str("listenAddr: \"0.0.0.0:8080\"\nrouteServicesEnabled: true\n").unwrap_err();
		assert!(err.to_string().contains("routeServiceCurrentKeyHex"));
	}

	#[test]
	fn unknown_field_is_rejected() {
		let err = Config::load_from_str("listenAddr: \"0.0.0.0:8080\"\nnotAField: 1\n").unwrap_err();
		assert!(err.to_string().to_lowercase().contains("unknown field"));
	}
}
