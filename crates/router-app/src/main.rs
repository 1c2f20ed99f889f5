use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use router::access_log::{AccessLogSink, TracingSink};
use router::client::Client;
use router::config::Config;
use router::pipeline::{Pipeline, PipelineDeps, RequestContext};
use router::proxy::upgrade;
use router::registry::Registry;
use router::routeservice::Codec;
use router_core::logging::{self, LogFormat};
use router_core::metrics::Metrics;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "router", about = "HTTP reverse proxy and routing registry")]
struct Args {
	/// Path to the YAML configuration file. Falls back to $ROUTER_CONFIG.
	#[arg(long, env = "ROUTER_CONFIG")]
	config: Option<std::path::PathBuf>,

	/// Overrides the config's logFilter directive.
	#[arg(long)]
	log_filter: Option<String>,

	/// Dump the resolved configuration as JSON and exit without starting anything.
	#[arg(long)]
	print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config_path = args
		.config
		.clone()
		.context("--config (or $ROUTER_CONFIG) is required")?;
	let config = Config::load_from_file(&config_path).await.context("loading config")?;

	let log_filter = args.log_filter.as_deref().unwrap_or(&config.log_filter);
	let log_format = if config.log_json { LogFormat::Json } else { LogFormat::Text };
	logging::init(log_filter, log_format).context("initializing logging")?;

	if args.print_config {
		println!("{}", serde_json::to_string_pretty(&DebugConfig::from(&config))?);
		return Ok(());
	}

	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	raise_fd_limit();

	let registry = Arc::new(Registry::new(config.stale_threshold, config.drop_grace));
	let metrics = Arc::new(Metrics::new());
	let degraded = Arc::new(AtomicBool::new(false));
	let tls_roots = Arc::new(load_trust_roots(config.extra_ca_certs_path.as_deref())?);
	let client = Arc::new(Client::new(tls_roots, std::time::Duration::from_secs(10)));

	let route_service_codec = config.route_service_current_key.clone().map(|current| {
		Arc::new(Codec::new(current, config.route_service_previous_key.clone(), config.route_service_timeout))
	});

	if !config.nats_urls.is_empty() {
		spawn_subscriber(&config, registry.clone(), metrics.clone()).await?;
	} else {
		tracing::warn!("no natsUrls configured; router will never learn routes over the bus");
	}

	spawn_pruner(registry.clone());

	let stages = Pipeline::default_stages(PipelineDeps {
		registry: registry.clone(),
		metrics: metrics.clone(),
		client: client.clone(),
		config: config.clone(),
		route_service_codec,
		degraded: degraded.clone(),
	});
	let pipeline = Arc::new(Pipeline::new(stages));
	let access_log: Arc<dyn AccessLogSink> = Arc::new(TracingSink);

	serve(config.listen_addr, pipeline, access_log).await
}

/// Fields worth echoing back for `--print-config`; the AEAD keys themselves never are.
#[derive(serde::Serialize)]
struct DebugConfig {
	listen_addr: SocketAddr,
	https_listen_addr: Option<SocketAddr>,
	health_listen_addr: Option<SocketAddr>,
	stale_threshold_secs: u64,
	drop_grace_secs: u64,
	max_attempts: u32,
	max_request_size: u64,
	route_services_enabled: bool,
	http2_enabled: bool,
	nats_urls: Vec<String>,
}

impl From<&Config> for DebugConfig {
	fn from(c: &Config) -> Self {
		DebugConfig {
			listen_addr: c.listen_addr,
			https_listen_addr: c.https_listen_addr,
			health_listen_addr: c.health_listen_addr,
			stale_threshold_secs: c.stale_threshold.as_secs(),
			drop_grace_secs: c.drop_grace.as_secs(),
			max_attempts: c.max_attempts,
			max_request_size: c.max_request_size,
			route_services_enabled: c.route_services_enabled,
			http2_enabled: c.http2_enabled,
			nats_urls: c.nats_urls.clone(),
		}
	}
}

/// Raises the process's open-file-descriptor soft limit to its hard limit. A proxy
/// holding thousands of concurrent client and backend connections hits the default
/// 1024 soft limit quickly; best-effort, since an unprivileged process can't always
/// raise it.
fn raise_fd_limit() {
	unsafe {
		let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
		if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
			return;
		}
		limit.rlim_cur = limit.rlim_max;
		if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
			tracing::debug!("failed to raise RLIMIT_NOFILE");
		}
	}
}

fn load_trust_roots(extra_ca_certs_path: Option<&std::path::Path>) -> anyhow::Result<rustls::RootCertStore> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		// A handful of platform roots fail to parse under webpki's stricter rules; skip
		// rather than fail startup over one bad system entry.
		let _ = roots.add(cert);
	}

	if let Some(path) = extra_ca_certs_path {
		let pem = fs_err::read(path).context("reading extraCaCertsPath")?;
		let mut reader = std::io::BufReader::new(pem.as_slice());
		for cert in rustls_pemfile::certs(&mut reader) {
			roots.add(cert.context("parsing extraCaCertsPath as PEM")?)?;
		}
	}

	Ok(roots)
}

async fn spawn_subscriber(config: &Config, registry: Arc<Registry>, metrics: Arc<Metrics>) -> anyhow::Result<()> {
	let bus = Arc::new(router::bus::NatsBus::connect(&config.nats_urls).await?);
	let router_id = uuid::Uuid::new_v4().to_string();
	let subscriber = Arc::new(router::bus::Subscriber::new(
		bus,
		registry,
		metrics,
		router_id,
		vec![config.listen_addr.to_string()],
		std::time::Duration::from_secs(20),
		config.drop_grace,
		config.http2_enabled,
	));
	tokio::spawn(async move {
		if let Err(e) = subscriber.run().await {
			tracing::error!(error = %e, "bus subscriber exited");
		}
	});
	Ok(())
}

fn spawn_pruner(registry: Arc<Registry>) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
		loop {
			interval.tick().await;
			registry.prune(router_core::time::unix_nanos_now());
		}
	});
}

async fn serve(addr: SocketAddr, pipeline: Arc<Pipeline>, access_log: Arc<dyn AccessLogSink>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await.context("binding listen address")?;
	tracing::info!(%addr, "router listening");

	loop {
		let (tcp, remote_addr) = match listener.accept().await {
			Ok(pair) => pair,
			Err(e) => {
				tracing::warn!(error = %e, "accept failed");
				continue;
			}
		};
		tcp.set_nodelay(true).ok();
		let pipeline = pipeline.clone();
		let access_log = access_log.clone();

		tokio::spawn(async move {
			let io = TokioIo::new(tcp);
			let service = service_fn(move |req| {
				let pipeline = pipeline.clone();
				let access_log = access_log.clone();
				async move { handle(pipeline, access_log, remote_addr, req).await }
			});
			if let Err(e) = hyper::server::conn::http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				tracing::debug!(error = %e, "client connection closed");
			}
		});
	}
}

async fn handle(
	pipeline: Arc<Pipeline>,
	access_log: Arc<dyn AccessLogSink>,
	remote_addr: SocketAddr,
	req: http::Request<hyper::body::Incoming>,
) -> Result<http::Response<router::client::Body>, std::convert::Infallible> {
	use http_body_util::BodyExt;

	if upgrade::is_upgrade_request(req.headers()) {
		tracing::debug!("upgrade requested; backend connection splicing is not wired into this pipeline yet");
	}
	let (parts, body) = req.into_parts();
	let req = http::Request::from_parts(parts, body.boxed());

	let mut ctx = RequestContext::new(Some(remote_addr), false);
	let resp = pipeline.run(&mut ctx, req).await;

	ctx.access_log.status = Some(resp.status().as_u16());
	ctx.access_log.duration = Some(ctx.started_at.elapsed());
	ctx.access_log.router_error = ctx.router_error;
	access_log.record(&ctx.access_log);

	Ok(resp)
}
