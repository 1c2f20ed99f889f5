/// A normalized `host` or `host/path/prefix` registry key: lowercase host, no port,
/// path segments joined without a leading or trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey(String);

impl RouteKey {
	pub fn parse(uri: &str) -> Self {
		let uri = uri.trim();
		let (host, path) = match uri.split_once('/') {
			Some((h, p)) => (h, p),
			None => (uri, ""),
		};
		let host = Self::normalize_host(host);
		if path.is_empty() {
			RouteKey(host)
		} else {
			RouteKey(format!("{host}/{}", path.trim_matches('/')))
		}
	}

	pub fn normalize_host(host: &str) -> String {
		host.split(':').next().unwrap_or(host).to_ascii_lowercase()
	}

	/// Yields registry keys to probe in longest-prefix-first order: the full
	/// `host/a/b/c`, then `host/a/b`, `host/a`, and finally the bare `host`.
	pub fn candidates(host: &str, path: &str) -> Vec<RouteKey> {
		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let mut out = Vec::with_capacity(segments.len() + 1);
		for take in (0..=segments.len()).rev() {
			if take == 0 {
				out.push(RouteKey(host.to_string()));
			} else {
				out.push(RouteKey(format!("{host}/{}", segments[..take].join("/"))));
			}
		}
		out
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for RouteKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_strips_port_and_lowercases_host() {
		let k = RouteKey::parse("App.Example.com:8080/Api");
		assert_eq!(k.as_str(), "app.example.com/Api");
	}

	#[test]
	fn candidates_are_longest_prefix_first() {
		let cands = RouteKey::candidates("app.x", "/api/v1/widgets");
		let strs: Vec<_> = cands.iter().map(RouteKey::as_str).collect();
		assert_eq!(strs, vec!["app.x/api/v1/widgets", "app.x/api/v1", "app.x/api", "app.x"]);
	}
}
