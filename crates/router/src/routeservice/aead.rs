use aws_lc_rs::aead::{AES_128_GCM, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use rand::RngCore;

/// A 16-byte AES-128-GCM key for the route-service envelope.
#[derive(Clone)]
pub struct Key(pub [u8; 16]);

impl Key {
	pub fn from_bytes(bytes: [u8; 16]) -> Self {
		Key(bytes)
	}

	pub fn from_hex(s: &str) -> anyhow::Result<Self> {
		let raw = hex::decode(s)?;
		let bytes: [u8; 16] = raw
			.try_into()
			.map_err(|v: Vec<u8>| anyhow::anyhow!("route-service key must be 16 bytes, got {}", v.len()))?;
		Ok(Key(bytes))
	}

	fn unbound(&self) -> LessSafeKey {
		let unbound =
			UnboundKey::new(&AES_128_GCM, &self.0).expect("16-byte key always valid for AES-128-GCM");
		LessSafeKey::new(unbound)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
	#[error("failed to open AEAD envelope")]
	Open,
}

/// Encrypts `plaintext` under `key` with a fresh random 12-byte nonce. Returns
/// `(ciphertext_with_tag, nonce)`.
pub fn seal(key: &Key, plaintext: &[u8]) -> (Vec<u8>, [u8; NONCE_LEN]) {
	let mut nonce_bytes = [0u8; NONCE_LEN];
	rand::rng().fill_bytes(&mut nonce_bytes);
	let nonce = Nonce::assume_unique_for_key(nonce_bytes);

	let mut in_out = plaintext.to_vec();
	key
		.unbound()
		.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
		.expect("sealing into an owned buffer cannot fail");
	(in_out, nonce_bytes)
}

/// Decrypts `ciphertext` (which must include the GCM tag) under `key` and `nonce`.
pub fn open(key: &Key, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, SignatureError> {
	let nonce_bytes: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| SignatureError::Open)?;
	let nonce = Nonce::assume_unique_for_key(nonce_bytes);
	let mut in_out = ciphertext.to_vec();
	let plaintext = key
		.unbound()
		.open_in_place(nonce, Aad::empty(), &mut in_out)
		.map_err(|_| SignatureError::Open)?;
	Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seal_then_open_round_trips() {
		let key = Key::from_bytes([7; 16]);
		let (ciphertext, nonce) = seal(&key, b"hello route service");
		let plaintext = open(&key, &ciphertext, &nonce).unwrap();
		assert_eq!(plaintext, b"hello route service");
	}

	#[test]
	fn open_fails_with_wrong_key() {
		let key_a = Key::from_bytes([1; 16]);
		let key_b = Key::from_bytes([2; 16]);
		let (ciphertext, nonce) = seal(&key_a, b"payload");
		assert!(open(&key_b, &ciphertext, &nonce).is_err());
	}

	#[test]
	fn from_hex_rejects_wrong_length() {
		assert!(Key::from_hex("aabb").is_err());
	}
}
