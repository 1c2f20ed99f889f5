use tokio::io::{AsyncRead, AsyncWrite};

use super::error::{ProxyError, classify_io};

/// `true` if the request headers indicate a WebSocket or raw TCP upgrade, tolerating
/// repeated/comma-joined `Connection` headers and case-insensitive tokens.
pub fn is_upgrade_request(headers: &http::HeaderMap) -> bool {
	let connection_has_upgrade = headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));

	let upgrade_kind = headers
		.get_all(http::header::UPGRADE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|v| {
			let v = v.trim();
			v.eq_ignore_ascii_case("websocket") || v.eq_ignore_ascii_case("tcp")
		});

	connection_has_upgrade && upgrade_kind
}

/// Splices two already-hijacked, already-upgraded connections until either side
/// closes. Used once the client's upgrade handshake and the backend's upgrade
/// handshake have both completed; the round tripper is bypassed entirely at that
/// point, so retry is not attempted here — only on the dial that preceded the splice.
pub async fn splice<A, B>(client: A, backend: B) -> Result<(u64, u64), ProxyError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let mut client = client;
	let mut backend = backend;
	tokio::io::copy_bidirectional(&mut client, &mut backend)
		.await
		.map_err(classify_io)
}
