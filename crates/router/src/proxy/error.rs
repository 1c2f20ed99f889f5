use router_core::metrics::ErrorClass;

/// Classified transport failure. Variant names match the taxonomy terms used across
/// logging, metrics and the status-code mapping so a log line and a metric increment
/// always agree on what happened.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
	#[error("dial failed: {0}")]
	DialFailed(String),
	#[error("connection reset on read: {0}")]
	ResetOnRead(String),
	#[error("attempted tls handshake against a plaintext backend: {0}")]
	AttemptedTlsToPlaintext(String),
	#[error("remote tls handshake failure: {0}")]
	RemoteHandshakeFailure(String),
	#[error("remote rejected our certificate: {0}")]
	RemoteCertCheckFailed(String),
	#[error("backend certificate name mismatch: {0}")]
	HostnameMismatch(String),
	#[error("backend certificate is untrusted: {0}")]
	UntrustedCert(String),
	#[error("route-service signature expired or invalid: {0}")]
	ExpiredRouteServiceSignature(String),
	#[error("client disconnected before a response was sent")]
	ClientGone,
	#[error("request deadline exceeded")]
	ContextCancelled,
}

impl ProxyError {
	pub fn class(&self) -> ErrorClass {
		match self {
			ProxyError::DialFailed(_) => ErrorClass::DialFailed,
			ProxyError::ResetOnRead(_) => ErrorClass::ResetOnRead,
			ProxyError::AttemptedTlsToPlaintext(_) => ErrorClass::AttemptedTlsToPlaintext,
			ProxyError::RemoteHandshakeFailure(_) => ErrorClass::RemoteHandshakeFailure,
			ProxyError::RemoteCertCheckFailed(_) => ErrorClass::RemoteCertCheckFailed,
			ProxyError::HostnameMismatch(_) => ErrorClass::HostnameMismatch,
			ProxyError::UntrustedCert(_) => ErrorClass::UntrustedCert,
			ProxyError::ExpiredRouteServiceSignature(_) => ErrorClass::ExpiredRouteServiceSignature,
			ProxyError::ClientGone => ErrorClass::ClientGone,
			ProxyError::ContextCancelled => ErrorClass::ContextCancelled,
		}
	}

	/// `true` if another attempt against a different endpoint is worth making.
	pub fn retriable(&self) -> bool {
		matches!(self, ProxyError::DialFailed(_) | ProxyError::ResetOnRead(_))
	}

	/// `true` if the endpoint is structurally broken and should be unregistered from
	/// its pool rather than merely skipped for this request.
	pub fn prunes_route(&self) -> bool {
		matches!(
			self,
			ProxyError::RemoteCertCheckFailed(_) | ProxyError::AttemptedTlsToPlaintext(_)
		)
	}

	pub fn status(&self) -> http::StatusCode {
		match self {
			ProxyError::DialFailed(_) => http::StatusCode::BAD_GATEWAY,
			ProxyError::ResetOnRead(_) => http::StatusCode::BAD_GATEWAY,
			ProxyError::AttemptedTlsToPlaintext(_) => http::StatusCode::from_u16(525).unwrap(),
			ProxyError::RemoteHandshakeFailure(_) => http::StatusCode::from_u16(525).unwrap(),
			ProxyError::RemoteCertCheckFailed(_) => http::StatusCode::from_u16(496).unwrap(),
			ProxyError::HostnameMismatch(_) => http::StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UntrustedCert(_) => http::StatusCode::from_u16(526).unwrap(),
			ProxyError::ExpiredRouteServiceSignature(_) => http::StatusCode::BAD_REQUEST,
			ProxyError::ClientGone => http::StatusCode::from_u16(499).unwrap(),
			ProxyError::ContextCancelled => http::StatusCode::BAD_GATEWAY,
		}
	}
}

pub fn classify_io(e: std::io::Error) -> ProxyError {
	use std::io::ErrorKind;
	match e.kind() {
		ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
			ProxyError::ResetOnRead(e.to_string())
		}
		_ => ProxyError::DialFailed(e.to_string()),
	}
}

pub fn classify_tls(e: std::io::Error) -> ProxyError {
	let Some(rustls_err) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) else {
		return classify_io(e);
	};
	match rustls_err {
		rustls::Error::CorruptMessage | rustls::Error::InvalidMessage(_) => {
			ProxyError::AttemptedTlsToPlaintext(rustls_err.to_string())
		}
		rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure) => {
			ProxyError::RemoteHandshakeFailure(rustls_err.to_string())
		}
		rustls::Error::AlertReceived(rustls::AlertDescription::CertificateUnknown)
		| rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate) => {
			ProxyError::RemoteCertCheckFailed(rustls_err.to_string())
		}
		rustls::Error::InvalidCertificate(_) => ProxyError::UntrustedCert(rustls_err.to_string()),
		rustls::Error::General(msg) if msg.contains("does not contain expected name") => {
			ProxyError::HostnameMismatch(rustls_err.to_string())
		}
		_ => ProxyError::RemoteHandshakeFailure(rustls_err.to_string()),
	}
}
