//! Link encryption.
//!
//! Each [`Connection`](crate::Connection) owns an X25519 [`KeyPair`]. Once
//! the peers have exchanged public keys (GREETINGS carries the outbound key,
//! BEGIN_SECURE the inbound one), both sides derive the same AES-256-GCM key
//! with HKDF-SHA256 and switch their pipeline to [`AesGcmCipher`].

use crate::error::{WireError, WireResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

const HKDF_SALT: &[u8] = b"agora-link-v1";
const HKDF_INFO: &[u8] = b"agora-link-aes256gcm";
const NONCE_SIZE: usize = 12;

/// A symmetric cipher applied to every frame after key exchange.
pub trait EncryptionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn encrypt(&self, data: &[u8]) -> WireResult<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> WireResult<Vec<u8>>;
}

/// Identity cipher used until BEGIN_SECURE.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl EncryptionProvider for PlainText {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn encrypt(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// AES-256-GCM with a random nonce prepended to every ciphertext.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derive the link key from a Diffie-Hellman shared secret.
    pub fn from_shared_secret(shared: &[u8]) -> WireResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared);
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| WireError::Encryption("key derivation failed".into()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| WireError::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }
}

impl EncryptionProvider for AesGcmCipher {
    fn name(&self) -> &'static str {
        "aes256gcm"
    }

    fn encrypt(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| WireError::Encryption(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(WireError::Encryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| WireError::Encryption(e.to_string()))
    }
}

/// Per-connection X25519 key material.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Base64 of the 32-byte public key, as carried in handshake bodies.
    pub fn public_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Compute the shared key with a peer's base64 public key and build the
    /// link cipher from it.
    pub fn cipher_for(&self, peer_public_b64: &str) -> WireResult<AesGcmCipher> {
        let raw = STANDARD
            .decode(peer_public_b64)
            .map_err(|e| WireError::Encryption(format!("bad peer key: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| WireError::Encryption("peer key must be 32 bytes".into()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(WireError::Encryption("non-contributory peer key".into()));
        }
        AesGcmCipher::from_shared_secret(shared.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_cipher() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let a = alice.cipher_for(&bob.public_base64()).unwrap();
        let b = bob.cipher_for(&alice.public_base64()).unwrap();

        let sealed = a.encrypt(b"over the wire").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"over the wire");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = AesGcmCipher::from_shared_secret(&[7u8; 32]).unwrap();
        assert_ne!(cipher.encrypt(b"x").unwrap(), cipher.encrypt(b"x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = AesGcmCipher::from_shared_secret(&[1u8; 32]).unwrap();
        let b = AesGcmCipher::from_shared_secret(&[2u8; 32]).unwrap();
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(matches!(b.decrypt(&sealed), Err(WireError::Encryption(_))));
        assert!(matches!(a.decrypt(&[0u8; 4]), Err(WireError::Encryption(_))));
    }

    #[test]
    fn test_rejects_malformed_peer_key() {
        let keys = KeyPair::generate();
        assert!(keys.cipher_for("not base64!").is_err());
        assert!(keys.cipher_for(&STANDARD.encode([1u8; 16])).is_err());
        assert!(keys.cipher_for(&STANDARD.encode([0u8; 32])).is_err());
    }
}
