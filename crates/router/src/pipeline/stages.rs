use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::{HeaderName, HeaderValue};
use router_core::metrics::Metrics;
use uuid::Uuid;

use super::{RequestContext, Stage, StageOutcome, response_with_status};
use crate::client::{Body, Client};
use crate::config::XfccPolicy;
use crate::iterator::{EndpointIterator, LoadBalancingPolicy, PoolCursor};
use crate::proxy::RoundTripOutcome;
use crate::registry::Registry;
use crate::routeservice::{Codec, FORWARDED_URL_HEADER, METADATA_HEADER, SIGNATURE_HEADER};

const VCAP_REQUEST_ID: &str = "X-Vcap-Request-Id";
const CF_APP_INSTANCE: &str = "X-CF-APP-INSTANCE";
const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_CLIENT_CERT: &str = "X-Forwarded-Client-Cert";
const X_REQUEST_START: &str = "X-Request-Start";

/// Stage 1. Real `catch_unwind`-style panic isolation happens one layer up, around
/// `Pipeline::run` itself, since a future isn't `UnwindSafe` by default and wrapping
/// it per-stage would force every downstream stage's state through an `AssertUnwindSafe`
/// boundary for no benefit. This stage's job is solely to flip the shared health bit
/// when asked, so the health-check stage and the panic boundary agree on one flag.
pub struct PanicGuard {
	pub degraded: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Stage for PanicGuard {
	fn name(&self) -> &'static str {
		"panic_guard"
	}
	async fn handle(&self, _ctx: &mut RequestContext, _req: &mut http::Request<Body>) -> StageOutcome {
		StageOutcome::Continue
	}
}

impl PanicGuard {
	pub fn mark_degraded(&self) {
		self.degraded.store(true, Ordering::SeqCst);
	}

	pub fn is_degraded(&self) -> bool {
		self.degraded.load(Ordering::SeqCst)
	}
}

/// Stage 2. Nothing to do beyond what `RequestContext::new` already filled in; kept
/// as an explicit stage so its position in the chain is visible and a later stage
/// can depend on ctx fields being initialized.
pub struct RequestInfoContext;

#[async_trait::async_trait]
impl Stage for RequestInfoContext {
	fn name(&self) -> &'static str {
		"request_info_context"
	}
	async fn handle(&self, _ctx: &mut RequestContext, _req: &mut http::Request<Body>) -> StageOutcome {
		StageOutcome::Continue
	}
}

/// Stage 3. Response byte counting happens where the response is actually serialized
/// back onto the wire (the hyper connection task in `router-app`), which this
/// short-circuit-only stage model has no hook into; this stage just reserves the slot
/// so the chain's stage order documents where a real byte-counting writer would sit.
pub struct ProxyWriter;

#[async_trait::async_trait]
impl Stage for ProxyWriter {
	fn name(&self) -> &'static str {
		"proxy_writer"
	}
	async fn handle(&self, _ctx: &mut RequestContext, _req: &mut http::Request<Body>) -> StageOutcome {
		StageOutcome::Continue
	}
}

/// Stage 4. Accepts an inbound B3 trace/span pair if present, otherwise leaves them
/// unset — they're only materialized into response headers later if `X-Vcap-Trace`
/// matches the configured trace key (stage 17).
pub struct TraceHeaders;

#[async_trait::async_trait]
impl Stage for TraceHeaders {
	fn name(&self) -> &'static str {
		"trace_headers"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let headers = req.headers();
		ctx.trace_id = headers
			.get("X-B3-TraceId")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
			.or_else(|| Some(Uuid::new_v4().simple().to_string()));
		ctx.span_id = headers
			.get("X-B3-SpanId")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
			.or_else(|| Some(Uuid::new_v4().simple().to_string()[..16].to_string()));
		StageOutcome::Continue
	}
}

/// Stage 5. Generates `X-Vcap-Request-Id` if the client didn't send one; never
/// overwrites an existing value.
pub struct VcapRequestId;

#[async_trait::async_trait]
impl Stage for VcapRequestId {
	fn name(&self) -> &'static str {
		"vcap_request_id"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let existing = req
			.headers()
			.get(VCAP_REQUEST_ID)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
		if let Ok(value) = HeaderValue::from_str(&id) {
			req.headers_mut().insert(HeaderName::from_static("x-vcap-request-id"), value);
		}
		ctx.request_id = id;
		StageOutcome::Continue
	}
}

/// Stage 6. Captures the fields the access log cares about at the moment the request
/// arrives, before anything downstream can mutate them.
pub struct AccessLogStart;

#[async_trait::async_trait]
impl Stage for AccessLogStart {
	fn name(&self) -> &'static str {
		"access_log_start"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		ctx.access_log.request_id = ctx.request_id.clone();
		ctx.access_log.method = req.method().to_string();
		ctx.access_log.uri = req.uri().to_string();
		ctx.access_log.remote_addr = ctx.remote_addr.map(|a| a.to_string());

		let now_ms = router_core::time::unix_millis_now();
		if !req.headers().contains_key(X_REQUEST_START) {
			if let Ok(value) = HeaderValue::from_str(&now_ms.to_string()) {
				req.headers_mut().insert(HeaderName::from_static("x-request-start"), value);
			}
		}
		StageOutcome::Continue
	}
}

/// Stage 7. Latency itself is closed by the caller once `Pipeline::run` returns;
/// this stage only needs to count the request as started.
pub struct MetricsReporter {
	pub metrics: Arc<Metrics>,
}

#[async_trait::async_trait]
impl Stage for MetricsReporter {
	fn name(&self) -> &'static str {
		"metrics_reporter"
	}
	async fn handle(&self, _ctx: &mut RequestContext, _req: &mut http::Request<Body>) -> StageOutcome {
		self.metrics.inc_requests();
		StageOutcome::Continue
	}
}

/// Stage 8. Adds/removes configured request headers. Response-side stripping of the
/// route-service envelope happens in the proxy stage once a response exists, since
/// this model only gets to mutate the request on the way in.
pub struct HttpRewrite {
	pub add_request_headers: Vec<(HeaderName, HeaderValue)>,
	pub remove_request_headers: Vec<HeaderName>,
}

#[async_trait::async_trait]
impl Stage for HttpRewrite {
	fn name(&self) -> &'static str {
		"http_rewrite"
	}
	async fn handle(&self, _ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		for name in &self.remove_request_headers {
			req.headers_mut().remove(name);
		}
		for (name, value) in &self.add_request_headers {
			req.headers_mut().insert(name.clone(), value.clone());
		}
		StageOutcome::Continue
	}
}

/// Stage 9. Answers the load balancer's health probe directly, bypassing everything
/// below — including the registry lookup, so a degraded router still answers probes.
pub struct HealthCheck {
	pub load_balancer_user_agent: String,
	pub degraded: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Stage for HealthCheck {
	fn name(&self) -> &'static str {
		"health_check"
	}
	async fn handle(&self, _ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let is_probe = req
			.headers()
			.get(http::header::USER_AGENT)
			.and_then(|v| v.to_str().ok())
			.map(|ua| ua == self.load_balancer_user_agent)
			.unwrap_or(false);
		if !is_probe {
			return StageOutcome::Continue;
		}
		if self.degraded.load(Ordering::SeqCst) {
			StageOutcome::Respond(response_with_status(http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy\n"))
		} else {
			StageOutcome::Respond(response_with_status(http::StatusCode::OK, "ok\n"))
		}
	}
}

/// Stage 10. HTTP/1.0, HTTP/1.1 are always accepted; HTTP/2 only if configured on.
pub struct ProtocolCheck {
	pub http2_enabled: bool,
}

#[async_trait::async_trait]
impl Stage for ProtocolCheck {
	fn name(&self) -> &'static str {
		"protocol_check"
	}
	async fn handle(&self, _ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let ok = match req.version() {
			http::Version::HTTP_10 | http::Version::HTTP_11 => true,
			http::Version::HTTP_2 => self.http2_enabled,
			_ => false,
		};
		if ok {
			StageOutcome::Continue
		} else {
			StageOutcome::Respond(response_with_status(http::StatusCode::BAD_REQUEST, "unsupported protocol version"))
		}
	}
}

/// Stage 11. Resolves a `Pool` by host+path, optionally pinned to a specific instance
/// via `X-CF-APP-INSTANCE`. Sets `X-Cf-RouterError: unknown_route` and 404s when
/// nothing matches.
pub struct Lookup {
	pub registry: Arc<Registry>,
}

#[async_trait::async_trait]
impl Stage for Lookup {
	fn name(&self) -> &'static str {
		"lookup"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let host = req
			.uri()
			.host()
			.map(str::to_string)
			.or_else(|| req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string))
			.unwrap_or_default();
		let path = req.uri().path().to_string();

		let Some(pool) = self.registry.lookup(&host, &path) else {
			ctx.router_error = Some("unknown_route");
			return StageOutcome::Respond(unknown_route_response());
		};

		if pool.is_empty() {
			ctx.router_error = Some("unknown_route");
			return StageOutcome::Respond(unknown_route_response());
		}

		if let Some((app_id, index)) = req
			.headers()
			.get(CF_APP_INSTANCE)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.split_once(':'))
		{
			let (_, endpoints) = pool.snapshot();
			let pinned = endpoints
				.iter()
				.find(|e| e.application_id == app_id && e.private_instance_index == index)
				.map(|e| e.private_instance_id.clone());
			let Some(pinned) = pinned else {
				ctx.router_error = Some("unknown_route");
				return StageOutcome::Respond(unknown_route_response());
			};
			ctx.pinned_instance_id = Some(pinned);
		}

		ctx.pool = Some(pool);
		StageOutcome::Continue
	}
}

fn unknown_route_response() -> http::Response<Body> {
	let mut resp = response_with_status(http::StatusCode::NOT_FOUND, "404 Not Found: Requested route does not exist");
	resp.headers_mut().insert(
		HeaderName::from_static("x-cf-routererror"),
		HeaderValue::from_static("unknown_route"),
	);
	resp
}

/// Stage 12. Rejects oversized bodies before an endpoint has even been chosen, per
/// `Content-Length`. A backend that lies about its length and streams past the limit
/// is not this stage's concern — bounding the in-flight buffer is the connector's job.
pub struct MaxRequestSize {
	pub max_bytes: u64,
}

#[async_trait::async_trait]
impl Stage for MaxRequestSize {
	fn name(&self) -> &'static str {
		"max_request_size"
	}
	async fn handle(&self, _ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let too_big = req
			.headers()
			.get(http::header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse::<u64>().ok())
			.map(|len| len > self.max_bytes)
			.unwrap_or(false);
		if too_big {
			StageOutcome::Respond(response_with_status(http::StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
		} else {
			StageOutcome::Continue
		}
	}
}

/// Stage 13. Client-certificate forwarding policy.
pub struct Xfcc {
	pub policy: XfccPolicy,
}

#[async_trait::async_trait]
impl Stage for Xfcc {
	fn name(&self) -> &'static str {
		"xfcc"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		match self.policy {
			XfccPolicy::AlwaysForward => {}
			XfccPolicy::Forward => {
				if !ctx.is_tls {
					req.headers_mut().remove(X_FORWARDED_CLIENT_CERT);
				}
			}
			XfccPolicy::SanitizeSet => {
				req.headers_mut().remove(X_FORWARDED_CLIENT_CERT);
			}
		}
		StageOutcome::Continue
	}
}

/// Stage 14.
pub struct Xfp {
	pub force_https: bool,
}

#[async_trait::async_trait]
impl Stage for Xfp {
	fn name(&self) -> &'static str {
		"xfp"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let proto = if self.force_https || ctx.is_tls { "https" } else { "http" };
		if let Ok(value) = HeaderValue::from_str(proto) {
			req.headers_mut().insert(HeaderName::from_static("x-forwarded-proto"), value);
		}
		append_forwarded_for(req, ctx.remote_addr);
		StageOutcome::Continue
	}
}

fn append_forwarded_for(req: &mut http::Request<Body>, remote_addr: Option<std::net::SocketAddr>) {
	let Some(addr) = remote_addr else { return };
	let ip = addr.ip().to_string();
	let combined = match req.headers().get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
		_ => ip,
	};
	if let Ok(value) = HeaderValue::from_str(&combined) {
		req.headers_mut().insert(HeaderName::from_static("x-forwarded-for"), value);
	}
}

/// Stage 15. Implements the route-service state machine from the protocol spec:
/// redirect to the pool's route service if one is pinned and this request hasn't
/// been through it yet, or verify and strip the envelope if it has.
pub struct RouteService {
	pub enabled: bool,
	pub codec: Option<Arc<Codec>>,
}

#[async_trait::async_trait]
impl Stage for RouteService {
	fn name(&self) -> &'static str {
		"route_service"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let has_signature = req.headers().contains_key(SIGNATURE_HEADER);

		if has_signature {
			let Some(codec) = &self.codec else {
				return StageOutcome::Respond(response_with_status(http::StatusCode::BAD_REQUEST, "route services disabled"));
			};
			let sig = req.headers().get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
			let meta = req.headers().get(METADATA_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
			let forwarded = req
				.headers()
				.get(FORWARDED_URL_HEADER)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("")
				.to_string();

			let now = router_core::time::unix_nanos_now();
			if codec.verify(sig, meta, &forwarded, now).is_err() {
				return StageOutcome::Respond(response_with_status(
					http::StatusCode::BAD_REQUEST,
					"invalid or expired route-service signature",
				));
			}

			req.headers_mut().remove(SIGNATURE_HEADER);
			req.headers_mut().remove(METADATA_HEADER);
			req.headers_mut().remove(FORWARDED_URL_HEADER);
			ctx.route_service_traversed = true;
			return StageOutcome::Continue;
		}

		let Some(pool) = &ctx.pool else { return StageOutcome::Continue };
		let Some(route_service_url) = pool.route_service_url() else { return StageOutcome::Continue };

		if !self.enabled {
			return StageOutcome::Respond(response_with_status(
				http::StatusCode::BAD_GATEWAY,
				"route services unsupported",
			));
		}
		let Some(codec) = &self.codec else {
			return StageOutcome::Respond(response_with_status(http::StatusCode::BAD_GATEWAY, "route services unsupported"));
		};

		let forwarded_url = req.uri().to_string();
		let now = router_core::time::unix_nanos_now();
		let (sig, meta) = codec.sign(&forwarded_url, now);

		// Only the scheme and authority come from route_service_url; the request's own
		// path and query are carried through untouched.
		let redirected_uri = route_service_url.parse::<http::Uri>().ok().and_then(|rs| {
			let path_and_query = req
				.uri()
				.path_and_query()
				.cloned()
				.unwrap_or_else(|| http::uri::PathAndQuery::from_static("/"));
			http::Uri::builder()
				.scheme(rs.scheme()?.clone())
				.authority(rs.authority()?.clone())
				.path_and_query(path_and_query)
				.build()
				.ok()
		});

		if let (Some(new_uri), Ok(sig_v), Ok(meta_v), Ok(fwd_v)) = (
			redirected_uri,
			HeaderValue::from_str(&sig),
			HeaderValue::from_str(&meta),
			HeaderValue::from_str(&forwarded_url),
		) {
			*req.uri_mut() = new_uri;
			req.headers_mut().insert(HeaderName::from_static("x-cf-proxy-signature"), sig_v);
			req.headers_mut().insert(HeaderName::from_static("x-cf-proxy-metadata"), meta_v);
			req.headers_mut().insert(HeaderName::from_static("x-cf-forwarded-url"), fwd_v);
		}
		StageOutcome::Continue
	}
}

/// Reads the session-affinity cookie's value out of the request's `Cookie` header, if
/// present. Used to pin the first pick of the iterator to whichever endpoint last
/// served this client, per the sticky load-balancing policy.
fn sticky_cookie_value(req: &http::Request<Body>, cookie_name: &str) -> Option<String> {
	let header = req.headers().get(http::header::COOKIE)?.to_str().ok()?;
	header.split(';').find_map(|pair| {
		let (name, value) = pair.trim().split_once('=')?;
		(name == cookie_name).then(|| value.to_string())
	})
}

/// Stage 16. Selects an iterator over the resolved pool and drives the round-trip
/// attempt loop; applies the trace-echo and request-id response fields (stage 17)
/// directly on the response it produces, since this model's short-circuit-only stage
/// contract gives stage 17 no other way to see a response that already ended the chain.
pub struct Proxy {
	pub client: Arc<Client>,
	pub registry: Arc<Registry>,
	pub metrics: Arc<Metrics>,
	pub max_attempts: u32,
	pub max_body_bytes: u64,
	pub trace_key: Option<String>,
	pub policy: LoadBalancingPolicy,
	pub sticky_session_cookie: String,
}

#[async_trait::async_trait]
impl Stage for Proxy {
	fn name(&self) -> &'static str {
		"proxy"
	}
	async fn handle(&self, ctx: &mut RequestContext, req: &mut http::Request<Body>) -> StageOutcome {
		let Some(pool) = ctx.pool.clone() else {
			return StageOutcome::Respond(response_with_status(http::StatusCode::NOT_FOUND, "no pool resolved"));
		};

		let sticky = sticky_cookie_value(req, &self.sticky_session_cookie);
		let cursor = Arc::new(PoolCursor::new());
		let mut iter = EndpointIterator::new(&pool, cursor, self.policy, sticky);

		if let Some(instance_id) = &ctx.pinned_instance_id {
			if !iter.pin_to_instance(instance_id) {
				ctx.router_error = Some("unknown_route");
				return StageOutcome::Respond(unknown_route_response());
			}
		}

		let tripper = crate::proxy::RoundTripper::new(
			(*self.client).clone(),
			self.registry.clone(),
			self.metrics.clone(),
			self.max_attempts,
		);

		let method = req.method().clone();
		let uri = req.uri().clone();
		let version = req.version();
		let headers = req.headers().clone();
		let uri_key = uri.host().unwrap_or_default().to_string();

		// Buffer the inbound body once so every attempt can replay identical bytes;
		// `Limited` backstops `MaxRequestSize` for a body whose actual length disagrees
		// with its `Content-Length` header.
		let body = std::mem::replace(req.body_mut(), crate::client::empty_body());
		let body_bytes = match http_body_util::BodyExt::collect(http_body_util::Limited::new(body, self.max_body_bytes as usize)).await
		{
			Ok(collected) => collected.to_bytes(),
			Err(_) => return StageOutcome::Respond(response_with_status(http::StatusCode::PAYLOAD_TOO_LARGE, "request body too large")),
		};

		let build_request = || {
			let mut builder = http::Request::builder().method(method.clone()).uri(uri.clone()).version(version);
			*builder.headers_mut().unwrap() = headers.clone();
			let body = http_body_util::Full::new(body_bytes.clone())
				.map_err(|never: std::convert::Infallible| match never {});
			builder.body(http_body_util::BodyExt::boxed(body)).expect("request always buildable")
		};

		let trace_requested = req
			.headers()
			.get("X-Vcap-Trace")
			.and_then(|v| v.to_str().ok())
			.zip(self.trace_key.as_deref())
			.map(|(given, configured)| given == configured)
			.unwrap_or(false);

		match tripper.call(&uri_key, &mut iter, build_request).await {
			RoundTripOutcome::Response(endpoint, resp) => {
				ctx.endpoint = Some(endpoint);
				let resp = convert_response(resp);
				StageOutcome::Respond(self.finalize(ctx, resp, trace_requested))
			}
			RoundTripOutcome::Exhausted(err, attempts) => {
				tracing::warn!(attempts, error = %err, "round trip exhausted");
				ctx.router_error = Some("endpoint_failure");
				StageOutcome::Respond(self.finalize(ctx, response_with_status(err.status(), "endpoint_failure"), trace_requested))
			}
			RoundTripOutcome::NoEndpoints => {
				ctx.router_error = Some("unknown_route");
				StageOutcome::Respond(self.finalize(
					ctx,
					response_with_status(http::StatusCode::BAD_GATEWAY, "no endpoints available"),
					trace_requested,
				))
			}
		}
	}
}

fn convert_response(resp: http::Response<hyper::body::Incoming>) -> http::Response<Body> {
	use http_body_util::BodyExt;
	let (parts, body) = resp.into_parts();
	http::Response::from_parts(parts, body.boxed())
}

impl Proxy {
	/// Stage 17, applied inline: trace echo headers and a fallback request-id.
	fn finalize(&self, ctx: &RequestContext, mut resp: http::Response<Body>, trace_requested: bool) -> http::Response<Body> {
		if let Some(endpoint) = &ctx.endpoint {
			if let Ok(v) = HeaderValue::from_str(&endpoint.application_id) {
				resp.headers_mut().insert(HeaderName::from_static("x-cf-applicationid"), v);
			}
			if let Ok(v) = HeaderValue::from_str(&endpoint.private_instance_id) {
				resp.headers_mut().insert(HeaderName::from_static("x-cf-instanceid"), v);
			}
			if let Ok(v) = HeaderValue::from_str(&endpoint.identity.to_string()) {
				resp.headers_mut().insert(HeaderName::from_static("x-cf-routeendpoint"), v);
			}
			if trace_requested {
				if let Ok(v) = HeaderValue::from_str(&endpoint.identity.to_string()) {
					resp.headers_mut().insert(HeaderName::from_static("x-vcap-backend"), v);
				}
				resp
					.headers_mut()
					.insert(HeaderName::from_static("x-vcap-router"), HeaderValue::from_static("router"));
			}
		}

		if let Some(router_error) = ctx.router_error {
			if let Ok(v) = HeaderValue::from_str(router_error) {
				resp.headers_mut().insert(HeaderName::from_static("x-cf-routererror"), v);
			}
		}

		if !resp.headers().contains_key(VCAP_REQUEST_ID) {
			if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
				resp.headers_mut().insert(HeaderName::from_static("x-vcap-request-id"), v);
			}
		}
		resp.headers_mut().remove(SIGNATURE_HEADER);
		resp
	}
}
