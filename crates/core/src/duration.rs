use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

/// Parses a Go-style duration string ("30s", "2m", "1h30m") into a [`Duration`].
pub fn parse(input: &str) -> anyhow::Result<Duration> {
	let nanos = go_parse_duration::parse_duration(input)
		.map_err(|e| anyhow::anyhow!("invalid duration {input:?}: {e:?}"))?;
	if nanos < 0 {
		anyhow::bail!("duration {input:?} must not be negative");
	}
	Ok(Duration::from_nanos(nanos as u64))
}

/// Renders a [`Duration`] in the same Go-style shorthand `parse` accepts.
pub fn render(d: Duration) -> String {
	durationfmt::to_string(d.as_secs_f64())
}

/// `serde_with`-free helper for `#[serde(with = "crate::duration::serde_dur")]` fields.
pub mod serde_dur {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&render(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		parse(&raw).map_err(D::Error::custom)
	}
}

/// As [`serde_dur`] but for `Option<Duration>` fields that default to `None`.
pub mod serde_dur_option {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_str(&render(*d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw: Option<String> = Option::deserialize(d)?;
		raw.map(|raw| parse(&raw).map_err(D::Error::custom)).transpose()
	}
}
