use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as nanoseconds since the Unix epoch.
///
/// Registry entries and the route-service envelope both need a wire-stable wall
/// clock timestamp rather than a monotonic `Instant`, since they travel across
/// process and host boundaries.
pub fn unix_nanos_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_nanos() as u64
}

pub fn unix_millis_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as u64
}
