mod aead;

use std::time::Duration;

pub use aead::{Key, SignatureError};

/// The decrypted contents of `X-CF-Proxy-Signature`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Signature {
	pub requested_time_unix_nanos: u64,
	pub forwarded_url: String,
}

pub const SIGNATURE_HEADER: &str = "X-CF-Proxy-Signature";
pub const METADATA_HEADER: &str = "X-CF-Proxy-Metadata";
pub const FORWARDED_URL_HEADER: &str = "X-CF-Forwarded-Url";

/// Signs and verifies the route-service envelope carried in three request headers.
///
/// Signing always uses `current`; verification tries `current` first and falls back to
/// `previous` so a key rotation does not reject in-flight requests signed under the old
/// key. Both keys are 16 bytes (AES-128-GCM).
pub struct Codec {
	current: Key,
	previous: Option<Key>,
	timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
	#[error("signature did not verify under any configured key")]
	BadSignature,
	#[error("signature expired: requested {requested_age:?} ago, timeout is {timeout:?}")]
	Expired { requested_age: Duration, timeout: Duration },
	#[error("forwarded_url {forwarded_url:?} does not match the reconstructed request URL {reconstructed:?}")]
	UrlMismatch { forwarded_url: String, reconstructed: String },
	#[error(transparent)]
	Malformed(#[from] serde_json::Error),
}

impl Codec {
	pub fn new(current: Key, previous: Option<Key>, timeout: Duration) -> Self {
		Codec { current, previous, timeout }
	}

	/// Produces `(signature_header_value, metadata_header_value)` for an outbound
	/// request being redirected to a route service.
	pub fn sign(&self, forwarded_url: &str, now_unix_nanos: u64) -> (String, String) {
		let sig = Signature {
			requested_time_unix_nanos: now_unix_nanos,
			forwarded_url: forwarded_url.to_string(),
		};
		let plaintext = serde_json::to_vec(&sig).expect("Signature always serializes");
		let (ciphertext, nonce) = aead::seal(&self.current, &plaintext);
		(base64_url(&ciphertext), base64_url(&nonce))
	}

	/// Verifies a returned envelope. `forwarded_url` and `now_unix_nanos` are the
	/// router's own reconstruction of the request, used to catch a route service that
	/// forwards a stale or forged URL.
	pub fn verify(
		&self,
		signature_b64: &str,
		metadata_b64: &str,
		expected_forwarded_url: &str,
		now_unix_nanos: u64,
	) -> Result<Signature, VerifyError> {
		let ciphertext = base64_url_decode(signature_b64).ok_or(VerifyError::BadSignature)?;
		let nonce = base64_url_decode(metadata_b64).ok_or(VerifyError::BadSignature)?;

		let plaintext = aead::open(&self.current, &ciphertext, &nonce)
			.or_else(|_| {
				self
					.previous
					.as_ref()
					.ok_or(SignatureError::Open)
					.and_then(|prev| aead::open(prev, &ciphertext, &nonce))
			})
			.map_err(|_| VerifyError::BadSignature)?;

		let sig: Signature = serde_json::from_slice(&plaintext)?;

		let age = Duration::from_nanos(now_unix_nanos.saturating_sub(sig.requested_time_unix_nanos));
		if age > self.timeout {
			return Err(VerifyError::Expired { requested_age: age, timeout: self.timeout });
		}

		if sig.forwarded_url != expected_forwarded_url {
			return Err(VerifyError::UrlMismatch {
				forwarded_url: sig.forwarded_url,
				reconstructed: expected_forwarded_url.to_string(),
			});
		}

		Ok(sig)
	}
}

fn base64_url(bytes: &[u8]) -> String {
	use base64::Engine;
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn base64_url_decode(s: &str) -> Option<Vec<u8>> {
	use base64::Engine;
	base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(byte: u8) -> Key {
		Key::from_bytes([byte; 16])
	}

	#[test]
	fn sign_then_verify_round_trips() {
		let codec = Codec::new(key(1), None, Duration::from_secs(60));
		let (sig, meta) = codec.sign("https://app.x/p?q=1", 1_000_000_000);
		let verified = codec
			.verify(&sig, &meta, "https://app.x/p?q=1", 1_000_000_000 + 5_000_000_000)
			.unwrap();
		assert_eq!(verified.forwarded_url, "https://app.x/p?q=1");
	}

	#[test]
	fn verify_rejects_after_timeout() {
		let codec = Codec::new(key(1), None, Duration::from_secs(60));
		let (sig, meta) = codec.sign("https://app.x/", 0);
		let far_future = Duration::from_secs(120).as_nanos() as u64;
		let err = codec.verify(&sig, &meta, "https://app.x/", far_future).unwrap_err();
		assert!(matches!(err, VerifyError::Expired { .. }));
	}

	#[test]
	fn verify_rejects_url_mismatch() {
		let codec = Codec::new(key(1), None, Duration::from_secs(60));
		let (sig, meta) = codec.sign("https://app.x/a", 0);
		let err = codec.verify(&sig, &meta, "https://app.x/b", 0).unwrap_err();
		assert!(matches!(err, VerifyError::UrlMismatch { .. }));
	}

	#[test]
	fn verify_falls_back_to_previous_key_after_rotation() {
		let signer = Codec::new(key(1), None, Duration::from_secs(60));
		let (sig, meta) = signer.sign("https://app.x/", 0);

		let rotated = Codec::new(key(2), Some(key(1)), Duration::from_secs(60));
		let verified = rotated.verify(&sig, &meta, "https://app.x/", 0).unwrap();
		assert_eq!(verified.forwarded_url, "https://app.x/");
	}

	#[test]
	fn verify_rejects_when_neither_key_matches() {
		let signer = Codec::new(key(1), None, Duration::from_secs(60));
		let (sig, meta) = signer.sign("https://app.x/", 0);

		let unrelated = Codec::new(key(9), Some(key(8)), Duration::from_secs(60));
		assert!(unrelated.verify(&sig, &meta, "https://app.x/", 0).is_err());
	}
}
