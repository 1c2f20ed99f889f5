pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use crate::proxy::error::{ProxyError, classify_io, classify_tls};
use crate::types::endpoint::Protocol;
use crate::types::Endpoint;

pub type Body = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> Body {
	Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// Performs one TCP (and, if the endpoint is TLS, TLS) dial plus handshake and sends
/// `req` over it. Each call is its own connection — a pool keyed by endpoint identity
/// is a worthwhile future optimization, but per-call dialing is what the round-tripper's
/// retry semantics actually depend on.
#[derive(Clone)]
pub struct Client {
	tls_roots: Arc<rustls::RootCertStore>,
	dial_timeout: Duration,
}

impl Client {
	pub fn new(tls_roots: Arc<rustls::RootCertStore>, dial_timeout: Duration) -> Self {
		Client { tls_roots, dial_timeout }
	}

	pub async fn call(
		&self,
		endpoint: &Endpoint,
		req: http::Request<Body>,
	) -> Result<http::Response<hyper::body::Incoming>, ProxyError> {
		let addr = endpoint
			.socket_addr()
			.map_err(|_| ProxyError::DialFailed("unresolvable endpoint address".into()))?;

		let tcp = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ProxyError::DialFailed("connect timed out".into()))?
			.map_err(classify_io)?;
		tcp.set_nodelay(true).ok();

		if endpoint.tls {
			self.call_tls(endpoint, tcp, req).await
		} else {
			self.call_plaintext(endpoint.protocol, tcp, req).await
		}
	}

	async fn call_tls(
		&self,
		endpoint: &Endpoint,
		tcp: TcpStream,
		req: http::Request<Body>,
	) -> Result<http::Response<hyper::body::Incoming>, ProxyError> {
		let config = tls::client_config(self.tls_roots.clone(), endpoint)?;
		let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
		let server_name = tls::server_name(endpoint)?;

		let tls_stream = connector
			.connect(server_name, tcp)
			.await
			.map_err(classify_tls)?;

		self.send(endpoint.protocol, TokioIo::new(tls_stream), req).await
	}

	async fn call_plaintext(
		&self,
		protocol: Protocol,
		tcp: TcpStream,
		req: http::Request<Body>,
	) -> Result<http::Response<hyper::body::Incoming>, ProxyError> {
		self.send(protocol, TokioIo::new(tcp), req).await
	}

	async fn send<IO>(
		&self,
		protocol: Protocol,
		io: IO,
		req: http::Request<Body>,
	) -> Result<http::Response<hyper::body::Incoming>, ProxyError>
	where
		IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
	{
		match protocol {
			Protocol::Http2 => {
				let (mut sender, conn) = http2::Builder::new(TokioExecutor::new())
					.handshake(io)
					.await
					.map_err(|e| ProxyError::RemoteHandshakeFailure(e.to_string()))?;
				tokio::spawn(async move {
					if let Err(e) = conn.await {
						tracing::debug!(error = %e, "backend http2 connection closed");
					}
				});
				sender.send_request(req).await.map_err(classify_hyper)
			}
			Protocol::Http1 => {
				let (mut sender, conn) = http1::Builder::new()
					.handshake(io)
					.await
					.map_err(|e| ProxyError::RemoteHandshakeFailure(e.to_string()))?;
				tokio::spawn(async move {
					if let Err(e) = conn.await {
						tracing::debug!(error = %e, "backend http1 connection closed");
					}
				});
				sender.send_request(req).await.map_err(classify_hyper)
			}
		}
	}
}

fn classify_hyper(e: hyper::Error) -> ProxyError {
	if e.is_incomplete_message() || e.is_closed() {
		ProxyError::ResetOnRead(e.to_string())
	} else {
		ProxyError::DialFailed(e.to_string())
	}
}
