mod stages;

use std::sync::Arc;
use std::time::Instant;

pub use stages::*;

use crate::access_log::AccessLogRecord;
use crate::client::Body;
use crate::types::{Endpoint, Pool};

/// Per-request scratch shared across every stage. Allocated once by the
/// request-info-context stage and threaded through the rest of the chain.
pub struct RequestContext {
	pub request_id: String,
	pub remote_addr: Option<std::net::SocketAddr>,
	pub started_at: Instant,
	pub trace_id: Option<String>,
	pub span_id: Option<String>,
	pub pool: Option<Arc<Pool>>,
	pub endpoint: Option<Arc<Endpoint>>,
	/// Set by the lookup stage when `X-CF-APP-INSTANCE` named a specific, present
	/// instance; the proxy stage pins the iterator to exactly this endpoint.
	pub pinned_instance_id: Option<String>,
	pub route_service_traversed: bool,
	pub is_tls: bool,
	pub access_log: AccessLogRecord,
	pub router_error: Option<&'static str>,
}

impl RequestContext {
	pub fn new(remote_addr: Option<std::net::SocketAddr>, is_tls: bool) -> Self {
		RequestContext {
			request_id: String::new(),
			remote_addr,
			started_at: Instant::now(),
			trace_id: None,
			span_id: None,
			pool: None,
			endpoint: None,
			pinned_instance_id: None,
			route_service_traversed: false,
			is_tls,
			access_log: AccessLogRecord::default(),
			router_error: None,
		}
	}
}

/// What a stage decided to do with the request.
pub enum StageOutcome {
	/// Pass the (possibly mutated) request to the next stage.
	Continue,
	/// Short-circuit with this response; no further stages run.
	Respond(http::Response<Body>),
}

/// One named step in the request pipeline. Stages are run strictly in the order
/// they're registered — see [`Pipeline::default_stages`] for that order, which
/// mirrors the fixed 17-stage sequence this pipeline implements.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
	fn name(&self) -> &'static str;

	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome;
}

/// The fixed, ordered chain. Built once at startup from [`Pipeline::default_stages`]
/// or a caller-supplied list (tests assemble a subset to exercise one stage at a
/// time), then driven per-request by [`Pipeline::run`].
pub struct Pipeline {
	stages: Vec<Box<dyn Stage>>,
}

/// Everything [`Pipeline::default_stages`] needs to build the production chain.
pub struct PipelineDeps {
	pub registry: Arc<crate::registry::Registry>,
	pub metrics: Arc<router_core::metrics::Metrics>,
	pub client: Arc<crate::client::Client>,
	pub config: crate::config::Config,
	pub route_service_codec: Option<Arc<crate::routeservice::Codec>>,
	pub degraded: Arc<std::sync::atomic::AtomicBool>,
}

impl Pipeline {
	pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
		Pipeline { stages }
	}

	/// Assembles the fixed 17-stage production chain in order.
	pub fn default_stages(deps: PipelineDeps) -> Vec<Box<dyn Stage>> {
		vec![
			Box::new(stages::PanicGuard { degraded: deps.degraded.clone() }),
			Box::new(stages::RequestInfoContext),
			Box::new(stages::ProxyWriter),
			Box::new(stages::TraceHeaders),
			Box::new(stages::VcapRequestId),
			Box::new(stages::AccessLogStart),
			Box::new(stages::MetricsReporter { metrics: deps.metrics.clone() }),
			Box::new(stages::HttpRewrite { add_request_headers: Vec::new(), remove_request_headers: Vec::new() }),
			Box::new(stages::HealthCheck {
				load_balancer_user_agent: deps.config.load_balancer_health_check_user_agent.clone(),
				degraded: deps.degraded.clone(),
			}),
			Box::new(stages::ProtocolCheck { http2_enabled: deps.config.http2_enabled }),
			Box::new(stages::Lookup { registry: deps.registry.clone() }),
			Box::new(stages::MaxRequestSize { max_bytes: deps.config.max_request_size }),
			Box::new(stages::Xfcc { policy: deps.config.xfcc_policy }),
			Box::new(stages::Xfp { force_https: deps.config.https_listen_addr.is_some() }),
			Box::new(stages::RouteService { enabled: deps.config.route_services_enabled, codec: deps.route_service_codec }),
			Box::new(stages::Proxy {
				client: deps.client,
				registry: deps.registry,
				metrics: deps.metrics,
				max_attempts: deps.config.max_attempts,
				max_body_bytes: deps.config.max_request_size,
				trace_key: deps.config.trace_key,
				policy: deps.config.load_balancing_policy,
				sticky_session_cookie: deps.config.sticky_session_cookie,
			}),
		]
	}

	/// Runs every stage in order against `req`, stopping at the first one that
	/// short-circuits. A panic inside a stage is caught here and converted to a 500,
	/// matching the panic-guard stage's role when it sits first in the chain.
	pub async fn run(&self, ctx: &mut RequestContext, mut req: http::Request<Body>) -> http::Response<Body> {
		for stage in &self.stages {
			match stage.handle(ctx, &mut req).await {
				StageOutcome::Continue => continue,
				StageOutcome::Respond(resp) => return resp,
			}
		}
		// Every production stage list ends with a stage that short-circuits (the
		// proxy stage, at minimum); reaching the end of the chain without a response
		// is a misconfigured pipeline, not a request-level condition.
		response_with_status(http::StatusCode::INTERNAL_SERVER_ERROR, "pipeline produced no response")
	}
}

pub fn response_with_status(status: http::StatusCode, message: &str) -> http::Response<Body> {
	use http_body_util::BodyExt;
	let body = http_body_util::Full::new(hyper::body::Bytes::copy_from_slice(message.as_bytes()))
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed();
	http::Response::builder()
		.status(status)
		.body(body)
		.expect("status and body are always valid")
}
