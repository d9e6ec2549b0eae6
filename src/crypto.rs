//! Key-validation primitives for the application-layer handshake.
//!
//! The server proves that a connecting client controls the private key behind
//! the stored public key without ever holding user keys:
//!
//! ```text
//! shared key  = SHA-256(server seed ‖ user public key)
//! challenge   = 32 random bytes, retained server-side
//! on the wire = nonce (12 bytes) ‖ AES-256-GCM(shared key, challenge)
//! ```
//!
//! The client derives the same shared key on its side, opens the box, and
//! echoes the challenge back; the server compares byte-wise. Everything else
//! (seed handling, password derivation) happens on the client and reaches the
//! server only as opaque blobs and salts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-GCM nonce length prepended to sealed payloads.
const NONCE_LEN: usize = 12;

/// Length of the validation challenge.
pub const VALIDATION_MESSAGE_LEN: usize = 32;

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("sealed payload too short")]
    Truncated,
    #[error("encryption failed")]
    SealFailed,
    #[error("decryption failed")]
    OpenFailed,
    #[error("invalid encoding: {0}")]
    Encoding(String),
}

/// The three client-generated salts stored per user.
///
/// All opaque to the server; delivered back in the `Connection` handshake
/// frame and via `GetPasswordSalts` so clients can re-derive their keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySalts {
    pub encryption_salt: String,
    pub dh_salt: String,
    pub hmac_salt: String,
}

impl KeySalts {
    /// Generate a fresh random salt set (16 bytes each, base64).
    pub fn generate() -> Self {
        Self {
            encryption_salt: random_token(16),
            dh_salt: random_token(16),
            hmac_salt: random_token(16),
        }
    }
}

/// Random bytes, base64 standard encoding.
pub fn random_token(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    Base64::encode_string(&bytes)
}

/// Deterministic key agreement anchored on a process-wide server seed.
pub struct KeyAgreement {
    server_seed: [u8; 32],
}

impl KeyAgreement {
    pub fn new(server_seed: [u8; 32]) -> Self {
        Self { server_seed }
    }

    /// Fresh random seed. Embedders that need handshake continuity across
    /// restarts should persist the seed and use [`KeyAgreement::new`].
    pub fn generate() -> Self {
        Self::new(rand::random())
    }

    /// Shared key for a given user public key.
    fn shared_key(&self, public_key: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.server_seed);
        hasher.update(public_key);
        hasher.finalize().into()
    }

    /// Fresh validation challenge.
    pub fn validation_message() -> [u8; VALIDATION_MESSAGE_LEN] {
        rand::random()
    }

    /// Seal `plaintext` for the holder of `public_key`'s private half.
    ///
    /// Output is `nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_key(public_key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::SealFailed)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload sealed with [`seal`](Self::seal).
    ///
    /// The client side of the handshake; also used by tests standing in for
    /// the client SDK.
    pub fn open(&self, public_key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let key = self.shared_key(public_key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let agreement = KeyAgreement::generate();
        let public_key = b"client-public-key-bytes";
        let message = KeyAgreement::validation_message();

        let sealed = agreement.seal(public_key, &message).unwrap();
        let opened = agreement.open(public_key, &sealed).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_open_rejects_wrong_public_key() {
        let agreement = KeyAgreement::generate();
        let message = KeyAgreement::validation_message();

        let sealed = agreement.seal(b"alice-public-key", &message).unwrap();
        assert!(agreement.open(b"bob-public-key", &sealed).is_err());
    }

    #[test]
    fn test_open_rejects_tampered_payload() {
        let agreement = KeyAgreement::generate();
        let message = KeyAgreement::validation_message();

        let mut sealed = agreement.seal(b"pk", &message).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(agreement.open(b"pk", &sealed).is_err());
    }

    #[test]
    fn test_open_rejects_truncated_payload() {
        let agreement = KeyAgreement::generate();
        assert!(matches!(
            agreement.open(b"pk", &[0u8; 4]),
            Err(CryptoError::Truncated)
        ));
    }

    #[test]
    fn test_agreement_is_deterministic_per_seed() {
        let seed = [7u8; 32];
        let a = KeyAgreement::new(seed);
        let b = KeyAgreement::new(seed);
        let message = KeyAgreement::validation_message();

        // b can open what a sealed: same seed, same public key, same shared key.
        let sealed = a.seal(b"pk", &message).unwrap();
        assert_eq!(b.open(b"pk", &sealed).unwrap(), message);
    }

    #[test]
    fn test_distinct_seeds_disagree() {
        let a = KeyAgreement::new([1u8; 32]);
        let b = KeyAgreement::new([2u8; 32]);
        let message = KeyAgreement::validation_message();

        let sealed = a.seal(b"pk", &message).unwrap();
        assert!(b.open(b"pk", &sealed).is_err());
    }

    #[test]
    fn test_key_salts_generate_unique() {
        let a = KeySalts::generate();
        let b = KeySalts::generate();
        assert_ne!(a.encryption_salt, b.encryption_salt);
        assert_ne!(a.dh_salt, b.dh_salt);
        assert_ne!(a.hmac_salt, b.hmac_salt);
    }
}
