use std::collections::HashMap;
use std::time::Duration;

/// Fields accumulated across the pipeline for one request, handed to an
/// [`AccessLogSink`] once the response finishes.
#[derive(Debug, Default)]
pub struct AccessLogRecord {
	pub request_id: String,
	pub method: String,
	pub uri: String,
	pub remote_addr: Option<String>,
	pub status: Option<u16>,
	pub response_bytes: u64,
	pub duration: Option<Duration>,
	pub router_error: Option<&'static str>,
	pub extra: HashMap<String, String>,
}

/// Destination for finished [`AccessLogRecord`]s. Durable file-backed logging with
/// rotation is an external concern; this trait is the seam the pipeline writes
/// through, and [`TracingSink`] is the sink used in tests and local runs.
pub trait AccessLogSink: Send + Sync {
	fn record(&self, entry: &AccessLogRecord);
}

/// Emits one `tracing` event per request at `info`, with the record's fields attached
/// as structured fields rather than interpolated into the message.
pub struct TracingSink;

impl AccessLogSink for TracingSink {
	fn record(&self, entry: &AccessLogRecord) {
		tracing::info!(
			request_id = %entry.request_id,
			method = %entry.method,
			uri = %entry.uri,
			remote_addr = entry.remote_addr.as_deref().unwrap_or(""),
			status = entry.status.unwrap_or(0),
			response_bytes = entry.response_bytes,
			duration_ms = entry.duration.map(|d| d.as_millis() as u64).unwrap_or(0),
			router_error = entry.router_error.unwrap_or(""),
			"request"
		);
	}
}
