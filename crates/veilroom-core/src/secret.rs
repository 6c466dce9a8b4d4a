//! Group secret lifecycle: generation and pairwise sealing
//!
//! The group secret encrypts all chat bodies. It is born with the room,
//! handed to each joiner sealed under a pairwise key (welcome), rotated
//! after every kick (rekey), and transferred on voluntary host handoff
//! (promote-notify). It never appears on the wire unsealed.

use rand::RngCore;

use crate::crypto::stateless;
use crate::error::{RoomError, RoomResult};
use crate::identity::DeviceKeypair;

/// The room's current symmetric secret.
///
/// Exactly one active value per peer's view; views diverge transiently
/// while a rotation propagates, which is why undecryptable chat bodies
/// are dropped rather than reported.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupSecret([u8; 32]);

impl GroupSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw key material.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("GroupSecret(..)")
    }
}

/// Seal the group secret for one peer under the pairwise key derived
/// from our keypair and their exchange public key. Returns hex
/// ciphertext for an envelope field.
pub fn seal_secret(
    keypair: &DeviceKeypair,
    peer_exchange_hex: &str,
    secret: &GroupSecret,
) -> RoomResult<String> {
    let pairwise = keypair.derive_shared(peer_exchange_hex)?;
    let sealed = stateless::encrypt(&pairwise, secret.as_bytes())?;
    Ok(hex::encode(sealed))
}

/// Open a sealed group secret received from a peer.
pub fn open_secret(
    keypair: &DeviceKeypair,
    peer_exchange_hex: &str,
    sealed_hex: &str,
) -> RoomResult<GroupSecret> {
    let bytes = open_string_raw(keypair, peer_exchange_hex, sealed_hex)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| RoomError::DecryptionFailed("Secret must be 32 bytes".to_string()))?;
    Ok(GroupSecret::from_bytes(bytes))
}

/// Seal an arbitrary string (the room password hash on handoff) under
/// the pairwise key with a peer.
pub fn seal_string(
    keypair: &DeviceKeypair,
    peer_exchange_hex: &str,
    value: &str,
) -> RoomResult<String> {
    let pairwise = keypair.derive_shared(peer_exchange_hex)?;
    let sealed = stateless::encrypt(&pairwise, value.as_bytes())?;
    Ok(hex::encode(sealed))
}

/// Open a sealed string received from a peer.
pub fn open_string(
    keypair: &DeviceKeypair,
    peer_exchange_hex: &str,
    sealed_hex: &str,
) -> RoomResult<String> {
    let bytes = open_string_raw(keypair, peer_exchange_hex, sealed_hex)?;
    String::from_utf8(bytes)
        .map_err(|e| RoomError::DecryptionFailed(format!("Sealed value not UTF-8: {}", e)))
}

fn open_string_raw(
    keypair: &DeviceKeypair,
    peer_exchange_hex: &str,
    sealed_hex: &str,
) -> RoomResult<Vec<u8>> {
    let pairwise = keypair.derive_shared(peer_exchange_hex)?;
    let sealed = hex::decode(sealed_hex)
        .map_err(|e| RoomError::DecryptionFailed(format!("Invalid ciphertext hex: {}", e)))?;
    stateless::decrypt(&pairwise, &sealed)
}
