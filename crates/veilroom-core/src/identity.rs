//! Session identity: signing and key-exchange keypairs
//!
//! Each session owns one Ed25519 signing key and one X25519 exchange key,
//! generated before any network action. Public halves travel in envelopes
//! as hex strings; the [`KeyDirectory`] collects every peer key observed
//! in verified traffic.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

use crate::error::{RoomError, RoomResult};
use crate::types::PeerId;

/// Domain-separation info for pairwise key derivation
const PAIRWISE_INFO: &[u8] = b"veilroom pairwise v1";

/// A peer's public key material as carried in envelopes.
///
/// Both keys are lowercase hex: `sign` is the Ed25519 verifying key
/// (the wire field `pub`), `exchange` the X25519 public key (the wire
/// field `epub`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Ed25519 verifying key, hex
    pub sign: String,
    /// X25519 exchange public key, hex
    pub exchange: String,
}

/// This session's keypair pair: Ed25519 for signing, X25519 for
/// Diffie-Hellman key exchange.
pub struct DeviceKeypair {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl DeviceKeypair {
    /// Generate a fresh keypair from OS entropy.
    ///
    /// Uses getrandom directly for the seeds to avoid rand version
    /// conflicts between the dalek crates.
    pub fn generate() -> Self {
        let mut sign_seed = [0u8; 32];
        getrandom::getrandom(&mut sign_seed).expect("system RNG unavailable");
        let signing = SigningKey::from_bytes(&sign_seed);

        let mut exchange_seed = [0u8; 32];
        getrandom::getrandom(&mut exchange_seed).expect("system RNG unavailable");
        let exchange = StaticSecret::from(exchange_seed);

        Self { signing, exchange }
    }

    /// Sign a canonical byte string, returning the signature as hex.
    pub fn sign(&self, content: &[u8]) -> String {
        hex::encode(self.signing.sign(content).to_bytes())
    }

    /// Public halves of this keypair for inclusion in envelopes.
    pub fn public_keys(&self) -> KeyBundle {
        KeyBundle {
            sign: hex::encode(self.signing.verifying_key().as_bytes()),
            exchange: hex::encode(ExchangePublicKey::from(&self.exchange).as_bytes()),
        }
    }

    /// Derive the pairwise symmetric key shared with a peer.
    ///
    /// X25519 Diffie-Hellman against the peer's exchange public key,
    /// expanded through HKDF-SHA256. Both sides derive the identical
    /// 32-byte key from their own secret and the other's public half.
    pub fn derive_shared(&self, peer_exchange_hex: &str) -> RoomResult<[u8; 32]> {
        let peer_public = ExchangePublicKey::from(decode_key32(peer_exchange_hex)?);
        let raw = self.exchange.diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, raw.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(PAIRWISE_INFO, &mut okm)
            .map_err(|e| RoomError::Identity(format!("HKDF expand failed: {}", e)))?;
        Ok(okm)
    }
}

impl std::fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field(
                "sign_public",
                &hex::encode(self.signing.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// Verify a hex signature over `content` against a hex Ed25519 key.
///
/// Returns false for malformed keys or signatures rather than erroring;
/// a hostile peer must not be able to disrupt the caller.
pub fn verify_signature(content: &[u8], signature_hex: &str, sign_key_hex: &str) -> bool {
    let key_bytes = match decode_key32(sign_key_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig_bytes = match hex::decode(signature_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(&sig_bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    key.verify(content, &signature).is_ok()
}

/// Decode a 32-byte key from hex.
fn decode_key32(hex_str: &str) -> RoomResult<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| RoomError::Identity(format!("Invalid key hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| RoomError::Identity("Key must be 32 bytes".to_string()))
}

/// Table of peer public keys, keyed by peer id.
///
/// Populated opportunistically whenever a peer's keys are observed in a
/// verified envelope (join, welcome peer list, user-joined,
/// promote-notify key table).
#[derive(Debug, Default)]
pub struct KeyDirectory {
    keys: HashMap<PeerId, KeyBundle>,
}

impl KeyDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's keys, replacing any previous bundle.
    pub fn insert(&mut self, peer: PeerId, bundle: KeyBundle) {
        self.keys.insert(peer, bundle);
    }

    /// Look up a peer's keys
    pub fn get(&self, peer: &PeerId) -> Option<&KeyBundle> {
        self.keys.get(peer)
    }

    /// Whether keys are known for this peer
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.keys.contains_key(peer)
    }

    /// Drop a peer's keys
    pub fn remove(&mut self, peer: &PeerId) {
        self.keys.remove(peer);
    }

    /// Iterate over all known (peer, bundle) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &KeyBundle)> {
        self.keys.iter()
    }

    /// Number of peers with known keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Forget everything (session teardown)
    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
