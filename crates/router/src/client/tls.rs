use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::proxy::error::ProxyError;
use crate::types::Endpoint;

/// Verifies the backend's certificate chain against the process-wide root pool, then
/// separately pins the leaf's CN/SAN to `expected`. This split (chain trust vs. name
/// pin) is what lets a registered `server_cert_domain_san` differ from the DNS name
/// the router dialed, which is the whole point of the pin: routing decisions and
/// certificate identity are independent in this system.
#[derive(Debug)]
struct PinnedNameVerifier {
	roots: Arc<rustls::client::WebPkiServerVerifier>,
	expected: String,
}

impl PinnedNameVerifier {
	fn new(roots: Arc<rustls::RootCertStore>, expected: String) -> Result<Self, ProxyError> {
		let verifier = rustls::client::WebPkiServerVerifier::builder(roots)
			.build()
			.map_err(|e| ProxyError::UntrustedCert(e.to_string()))?;
		Ok(PinnedNameVerifier { roots: verifier, expected })
	}
}

impl ServerCertVerifier for PinnedNameVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		self
			.roots
			.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
		verify_pinned_name(end_entity, &self.expected)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.roots.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.roots.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.roots.supported_verify_schemes()
	}
}

fn verify_pinned_name(cert: &CertificateDer<'_>, expected: &str) -> Result<ServerCertVerified, rustls::Error> {
	let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
		.map_err(|e| rustls::Error::General(format!("unparseable backend certificate: {e}")))?;

	let is_ip = expected.parse::<std::net::IpAddr>().is_ok();
	let sans: Vec<String> = parsed
		.subject_alternative_name()
		.ok()
		.flatten()
		.map(|ext| {
			ext
				.value
				.general_names
				.iter()
				.filter_map(|name| match name {
					x509_parser::extensions::GeneralName::DNSName(n) if !is_ip => Some(n.to_string()),
					x509_parser::extensions::GeneralName::IPAddress(ip) if is_ip => {
						Some(format_ip(ip))
					}
					_ => None,
				})
				.collect()
		})
		.unwrap_or_default();

	if sans.iter().any(|s| s.eq_ignore_ascii_case(expected)) {
		return Ok(ServerCertVerified::assertion());
	}

	// No DNS SANs present at all: fall back to Subject CN, matching widely deployed
	// (if legacy) backend certificates that never adopted SANs.
	if sans.is_empty() && !is_ip {
		if let Some(cn) = parsed
			.subject()
			.iter_common_name()
			.next()
			.and_then(|cn| cn.as_str().ok())
		{
			if cn.eq_ignore_ascii_case(expected) {
				return Ok(ServerCertVerified::assertion());
			}
		}
	}

	Err(rustls::Error::General(format!(
		"backend certificate does not contain expected name {expected:?}"
	)))
}

fn format_ip(raw: &[u8]) -> String {
	match raw.len() {
		4 => std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
		16 => {
			let mut octets = [0u8; 16];
			octets.copy_from_slice(raw);
			std::net::Ipv6Addr::from(octets).to_string()
		}
		_ => String::new(),
	}
}

/// Builds a per-dial `rustls::ClientConfig` pinned to `endpoint`'s expected name, if
/// one is registered; otherwise falls back to standard webpki hostname verification
/// against the endpoint's bare host.
pub fn client_config(roots: Arc<rustls::RootCertStore>, endpoint: &Endpoint) -> Result<rustls::ClientConfig, ProxyError> {
	let builder = rustls::ClientConfig::builder();
	let config = match &endpoint.server_cert_domain_san {
		Some(expected) => {
			let verifier = PinnedNameVerifier::new(roots, expected.clone())?;
			builder
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(verifier))
				.with_no_client_auth()
		}
		None => builder.with_root_certificates((*roots).clone()).with_no_client_auth(),
	};
	Ok(config)
}

pub fn server_name(endpoint: &Endpoint) -> Result<rustls::pki_types::ServerName<'static>, ProxyError> {
	let name = endpoint
		.server_cert_domain_san
		.clone()
		.unwrap_or_else(|| endpoint.identity.host.clone());
	rustls::pki_types::ServerName::try_from(name)
		.map(|n| n.to_owned())
		.map_err(|e| ProxyError::HostnameMismatch(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn self_signed(sans: Vec<String>) -> CertificateDer<'static> {
		let certified = rcgen::generate_simple_self_signed(sans).expect("generate cert");
		certified.cert.der().clone()
	}

	#[test]
	fn accepts_matching_san() {
		let cert = self_signed(vec!["backend.internal".to_string()]);
		assert!(verify_pinned_name(&cert, "backend.internal").is_ok());
	}

	#[test]
	fn rejects_mismatched_san() {
		let cert = self_signed(vec!["backend.internal".to_string()]);
		let err = verify_pinned_name(&cert, "evil.example.com");
		assert!(err.is_err());
	}

	#[test]
	fn san_match_is_case_insensitive() {
		let cert = self_signed(vec!["Backend.Internal".to_string()]);
		assert!(verify_pinned_name(&cert, "backend.internal").is_ok());
	}

	#[test]
	fn rejects_unrelated_name_with_other_sans_present() {
		let cert = self_signed(vec!["backend.internal".to_string(), "alt.internal".to_string()]);
		let err = verify_pinned_name(&cert, "evil.example.com");
		assert!(err.is_err());
	}
}
