use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use http::{Method, StatusCode};
use http_body_util::BodyExt;
use router::client::Client;
use router::config::Config;
use router::pipeline::{Pipeline, PipelineDeps, RequestContext};
use router::registry::Registry;
use router::types::endpoint::{Endpoint, ModificationTag, Protocol};
use router::types::EndpointIdentity;
use router_core::metrics::Metrics;
use wiremock::matchers::path_regex;
use wiremock::{Mock, ResponseTemplate};

fn backend_endpoint(addr: std::net::SocketAddr) -> Endpoint {
	Endpoint {
		identity: EndpointIdentity { host: addr.ip().to_string(), port: addr.port() },
		application_id: "app-guid".into(),
		private_instance_id: "inst-0".into(),
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

async fn build_pipeline(registry: Arc<Registry>, config: Config) -> Pipeline {
	let metrics = Arc::new(Metrics::new());
	let client = Arc::new(Client::new(Arc::new(rustls::RootCertStore::empty()), Duration::from_secs(2)));
	let stages = Pipeline::default_stages(PipelineDeps {
		registry,
		metrics,
		client,
		config,
		route_service_codec: None,
		degraded: Arc::new(AtomicBool::new(false)),
	});
	Pipeline::new(stages)
}

fn request(uri: &str) -> http::Request<router::client::Body> {
	http::Request::builder()
		.method(Method::GET)
		.uri(uri)
		.header(http::header::HOST, "app.example.com")
		.body(router::client::empty_body())
		.unwrap()
}

#[tokio::test]
async fn proxies_to_registered_backend_and_stamps_headers() {
	let mock = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*"))
		.respond_with(ResponseTemplate::new(200).set_body_string("hello from backend"))
		.mount(&mock)
		.await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	registry.register("app.example.com", backend_endpoint(*mock.address())).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let mut ctx = RequestContext::new(Some("203.0.113.5:4000".parse().unwrap()), false);
	let resp = pipeline.run(&mut ctx, request("http://app.example.com/widgets")).await;

	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("x-cf-applicationid").unwrap(), "app-guid");
	assert!(resp.headers().contains_key("x-vcap-request-id"));
}

#[tokio::test]
async fn forwards_client_ip_in_x_forwarded_for() {
	let mock = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	registry.register("app.example.com", backend_endpoint(*mock.address())).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let mut ctx = RequestContext::new(Some("198.51.100.9:5555".parse().unwrap()), false);
	let resp = pipeline.run(&mut ctx, request("http://app.example.com/")).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let received = mock.received_requests().await.unwrap();
	assert_eq!(received.len(), 1);
	let xff = received[0].headers.get("x-forwarded-for").unwrap().to_str().unwrap();
	assert_eq!(xff, "198.51.100.9");
}

#[tokio::test]
async fn retries_past_a_dead_endpoint_onto_a_healthy_one() {
	let mock = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	// Nothing is listening on this port: the first attempt must fail to dial.
	let mut dead = backend_endpoint("127.0.0.1:1".parse().unwrap());
	dead.modification_tag = ModificationTag::new("sender", 1);
	registry.register("app.example.com", dead).unwrap();
	let mut healthy = backend_endpoint(*mock.address());
	healthy.modification_tag = ModificationTag::new("sender", 2);
	registry.register("app.example.com", healthy).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\nmaxAttempts: 3\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, request("http://app.example.com/")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn oversized_request_is_rejected_before_any_endpoint_is_contacted() {
	let mock = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	registry.register("app.example.com", backend_endpoint(*mock.address())).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\nmaxRequestSize: 1024\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let req = http::Request::builder()
		.method(Method::POST)
		.uri("http://app.example.com/upload")
		.header(http::header::HOST, "app.example.com")
		.header(http::header::CONTENT_LENGTH, "50000000")
		.body(router::client::empty_body())
		.unwrap();

	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, req).await;
	assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
	assert!(mock.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_host_yields_404_with_router_error_header() {
	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, request("http://nowhere.example.com/")).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	assert_eq!(resp.headers().get("x-cf-routererror").unwrap(), "unknown_route");
}

#[tokio::test]
async fn post_body_reaches_the_backend() {
	let mock = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	registry.register("app.example.com", backend_endpoint(*mock.address())).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let payload = b"{\"widgets\":3}".to_vec();
	let req = http::Request::builder()
		.method(Method::POST)
		.uri("http://app.example.com/widgets")
		.header(http::header::HOST, "app.example.com")
		.body(http_body_util::Full::new(hyper::body::Bytes::from(payload.clone())).map_err(|never: std::convert::Infallible| match never {}).boxed())
		.unwrap();

	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, req).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let received = mock.received_requests().await.unwrap();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].body, payload);
}

#[tokio::test]
async fn pinned_instance_routes_only_to_the_named_endpoint() {
	let mock_a = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200).set_body_string("a")).mount(&mock_a).await;
	let mock_b = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200).set_body_string("b")).mount(&mock_b).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	let mut a = backend_endpoint(*mock_a.address());
	a.application_id = "app-guid".into();
	a.private_instance_id = "inst-aaa".into();
	a.private_instance_index = "0".into();
	a.modification_tag = ModificationTag::new("sender", 1);
	registry.register("app.example.com", a).unwrap();
	let mut b = backend_endpoint(*mock_b.address());
	b.application_id = "app-guid".into();
	b.private_instance_id = "inst-bbb".into();
	b.private_instance_index = "1".into();
	b.modification_tag = ModificationTag::new("sender", 2);
	registry.register("app.example.com", b).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let req = http::Request::builder()
		.uri("http://app.example.com/")
		.header(http::header::HOST, "app.example.com")
		.header("X-CF-APP-INSTANCE", "app-guid:1")
		.body(router::client::empty_body())
		.unwrap();
	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, req).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(mock_a.received_requests().await.unwrap().is_empty());
	assert_eq!(mock_b.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn pinned_instance_absent_yields_404() {
	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	registry.register("app.example.com", backend_endpoint("127.0.0.1:1".parse().unwrap())).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let req = http::Request::builder()
		.uri("http://app.example.com/")
		.header(http::header::HOST, "app.example.com")
		.header("X-CF-APP-INSTANCE", "app-guid:9")
		.body(router::client::empty_body())
		.unwrap();
	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, req).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	assert_eq!(resp.headers().get("x-cf-routererror").unwrap(), "unknown_route");
}

#[tokio::test]
async fn sticky_cookie_pins_first_pick_to_matching_endpoint() {
	let mock_a = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock_a).await;
	let mock_b = wiremock::MockServer::start().await;
	Mock::given(path_regex("/.*")).respond_with(ResponseTemplate::new(200)).mount(&mock_b).await;

	let registry = Arc::new(Registry::new(Duration::from_secs(120), Duration::from_secs(60)));
	let mut a = backend_endpoint(*mock_a.address());
	a.private_instance_id = "inst-aaa".into();
	a.modification_tag = ModificationTag::new("sender", 1);
	registry.register("app.example.com", a).unwrap();
	let mut b = backend_endpoint(*mock_b.address());
	b.private_instance_id = "inst-bbb".into();
	b.modification_tag = ModificationTag::new("sender", 2);
	registry.register("app.example.com", b).unwrap();

	let config = Config::load_from_str("listenAddr: \"127.0.0.1:0\"\n").unwrap();
	let pipeline = build_pipeline(registry, config).await;

	let req = http::Request::builder()
		.uri("http://app.example.com/")
		.header(http::header::HOST, "app.example.com")
		.header(http::header::COOKIE, "__VCAP_ID__=inst-bbb")
		.body(router::client::empty_body())
		.unwrap();
	let mut ctx = RequestContext::new(None, false);
	let resp = pipeline.run(&mut ctx, req).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(mock_a.received_requests().await.unwrap().is_empty());
	assert_eq!(mock_b.received_requests().await.unwrap().len(), 1);
}
