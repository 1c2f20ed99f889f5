use std::sync::atomic::{AtomicU64, Ordering};

/// Plain in-process counters and gauges the request path updates directly.
///
/// This purposefully has no scrape surface: exposing these over HTTP belongs to the
/// process's telemetry-emission layer, which is out of scope here. What lives in-core
/// is the bookkeeping the registry, iterator and round tripper need regardless of whether
/// anything ever reads it back out.
#[derive(Debug)]
pub struct Metrics {
	pub requests_total: AtomicU64,
	pub retries_total: AtomicU64,
	pub bus_messages_dropped: AtomicU64,
	pub bus_messages_invalid: AtomicU64,
	pub pools_total: AtomicU64,
	pub endpoints_total: AtomicU64,
	errors: [AtomicU64; ErrorClass::COUNT],
}

impl Default for Metrics {
	fn default() -> Self {
		Self {
			requests_total: AtomicU64::new(0),
			retries_total: AtomicU64::new(0),
			bus_messages_dropped: AtomicU64::new(0),
			bus_messages_invalid: AtomicU64::new(0),
			pools_total: AtomicU64::new(0),
			endpoints_total: AtomicU64::new(0),
			errors: std::array::from_fn(|_| AtomicU64::new(0)),
		}
	}
}

/// Mirrors the round tripper's error taxonomy so counts can be reported per class
/// without allocating a string key per increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorClass {
	DialFailed = 0,
	ResetOnRead = 1,
	AttemptedTlsToPlaintext = 2,
	RemoteHandshakeFailure = 3,
	RemoteCertCheckFailed = 4,
	HostnameMismatch = 5,
	UntrustedCert = 6,
	ExpiredRouteServiceSignature = 7,
	ClientGone = 8,
	ContextCancelled = 9,
}

impl ErrorClass {
	const COUNT: usize = 10;

	pub fn as_str(self) -> &'static str {
		match self {
			ErrorClass::DialFailed => "dial_failed",
			ErrorClass::ResetOnRead => "reset_on_read",
			ErrorClass::AttemptedTlsToPlaintext => "attempted_tls_to_plaintext",
			ErrorClass::RemoteHandshakeFailure => "remote_handshake_failure",
			ErrorClass::RemoteCertCheckFailed => "remote_cert_check_failed",
			ErrorClass::HostnameMismatch => "hostname_mismatch",
			ErrorClass::UntrustedCert => "untrusted_cert",
			ErrorClass::ExpiredRouteServiceSignature => "expired_route_service_signature",
			ErrorClass::ClientGone => "client_gone",
			ErrorClass::ContextCancelled => "context_cancelled",
		}
	}
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_error(&self, class: ErrorClass) {
		self.errors[class as usize].fetch_add(1, Ordering::Relaxed);
	}

	pub fn error_count(&self, class: ErrorClass) -> u64 {
		self.errors[class as usize].load(Ordering::Relaxed)
	}

	pub fn inc_requests(&self) {
		self.requests_total.fetch_add(1, Ordering::Relaxed);
	}

	pub fn inc_retries(&self) {
		self.retries_total.fetch_add(1, Ordering::Relaxed);
	}

	pub fn inc_bus_dropped(&self) {
		self.bus_messages_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub fn inc_bus_invalid(&self) {
		self.bus_messages_invalid.fetch_add(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_errors_per_class() {
		let m = Metrics::new();
		m.record_error(ErrorClass::DialFailed);
		m.record_error(ErrorClass::DialFailed);
		m.record_error(ErrorClass::UntrustedCert);
		assert_eq!(m.error_count(ErrorClass::DialFailed), 2);
		assert_eq!(m.error_count(ErrorClass::UntrustedCert), 1);
		assert_eq!(m.error_count(ErrorClass::ClientGone), 0);
	}
}
