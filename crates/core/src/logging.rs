use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format for the process-wide log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// Installs the global `tracing` subscriber. Call once, at process start.
///
/// `filter` is an `EnvFilter` directive string (e.g. `"router=debug,info"`); an empty
/// string falls back to `RUST_LOG`, and failing that to `info`.
pub fn init(filter: &str, format: LogFormat) -> anyhow::Result<()> {
	let env_filter = if filter.is_empty() {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	} else {
		EnvFilter::try_new(filter)?
	};

	let registry = tracing_subscriber::registry().with(env_filter);
	match format {
		LogFormat::Text => registry
			.with(tracing_subscriber::fmt::layer().with_target(true))
			.try_init()?,
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json().with_target(true))
			.try_init()?,
	}
	Ok(())
}
