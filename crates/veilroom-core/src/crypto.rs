//! Symmetric encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Chat bodies are encrypted under the room's current group secret, and
//! secrets themselves are sealed under pairwise-derived keys, all through
//! the same AEAD wrapper.

use crate::error::RoomError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Symmetric encryption for room traffic using ChaCha20-Poly1305 AEAD.
///
/// Holds a cipher instance initialized with a 32-byte key. Every
/// encryption uses a fresh random nonce prepended to the ciphertext.
///
/// # Wire Format
///
/// `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
pub struct GroupCrypto {
    cipher: ChaCha20Poly1305,
}

impl GroupCrypto {
    /// Create a new GroupCrypto instance with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key from the system CSPRNG.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt data, returning `[nonce] + [ciphertext + tag]`.
    ///
    /// A random nonce is generated per call, so the same plaintext
    /// never produces the same ciphertext twice.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, RoomError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| RoomError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data in the `[nonce] + [ciphertext + tag]` format.
    ///
    /// Fails on a wrong key, tampered data, or malformed input. Callers
    /// on the chat path treat failure as "stale secret" and drop the
    /// message silently.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RoomError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(RoomError::DecryptionFailed(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        let encrypted = &ciphertext[NONCE_SIZE..];

        self.cipher
            .decrypt(nonce, encrypted)
            .map_err(|e| RoomError::DecryptionFailed(format!("{}", e)))
    }
}

/// Convenience functions for one-shot encryption/decryption.
pub mod stateless {
    use super::*;

    /// Encrypt with a fresh cipher instance for `key`.
    pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, RoomError> {
        GroupCrypto::new(key).encrypt(plaintext)
    }

    /// Decrypt with a fresh cipher instance for `key`.
    pub fn decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, RoomError> {
        GroupCrypto::new(key).decrypt(ciphertext)
    }
}

/// Hash a room password with SHA-256 over `password + salt`, returning
/// lowercase hex.
///
/// The salt is the room id, so the same password yields different
/// hashes in different rooms. Join requests carry this hash, never the
/// plaintext password.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_is_random() {
        let key1 = GroupCrypto::generate_key();
        let key2 = GroupCrypto::generate_key();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = GroupCrypto::generate_key();
        let crypto = GroupCrypto::new(&key);

        let plaintext = b"attack at dawn";
        let ciphertext = crypto.encrypt(plaintext).unwrap();
        let decrypted = crypto.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let key = GroupCrypto::generate_key();
        let crypto = GroupCrypto::new(&key);

        let c1 = crypto.encrypt(b"hello").unwrap();
        let c2 = crypto.encrypt(b"hello").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto1 = GroupCrypto::new(&GroupCrypto::generate_key());
        let crypto2 = GroupCrypto::new(&GroupCrypto::generate_key());

        let ciphertext = crypto1.encrypt(b"secret").unwrap();
        let result = crypto2.decrypt(&ciphertext);
        assert!(matches!(result, Err(RoomError::DecryptionFailed(_))));
    }

    #[test]
    fn test_tampered_data_fails() {
        let key = GroupCrypto::generate_key();
        let crypto = GroupCrypto::new(&key);

        let mut ciphertext = crypto.encrypt(b"original").unwrap();
        ciphertext[NONCE_SIZE] ^= 0xFF;
        assert!(crypto.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let key = GroupCrypto::generate_key();
        let crypto = GroupCrypto::new(&key);

        let ciphertext = crypto.encrypt(b"original").unwrap();
        let result = crypto.decrypt(&ciphertext[..5]);
        assert!(matches!(result, Err(RoomError::DecryptionFailed(_))));
    }

    #[test]
    fn test_stateless_roundtrip() {
        let key = GroupCrypto::generate_key();
        let ciphertext = stateless::encrypt(&key, b"one-shot").unwrap();
        let decrypted = stateless::decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, b"one-shot");
    }

    #[test]
    fn test_hash_password_deterministic() {
        let a = hash_password("hunter2", "FIRE-AAA-BBBB");
        let b = hash_password("hunter2", "FIRE-AAA-BBBB");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // SHA-256 hex
    }

    #[test]
    fn test_hash_password_salted() {
        let a = hash_password("hunter2", "FIRE-AAA-BBBB");
        let b = hash_password("hunter2", "WAVE-CCC-DDDD");
        assert_ne!(a, b);
    }
}
