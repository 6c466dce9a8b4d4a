//! Signed protocol envelopes and canonical signing content
//!
//! Every value published to the shared log is an [`Envelope`]: the four
//! common fields (`id`, `sender`, `timestamp`, `signature`) plus one
//! [`Payload`] variant per message type. The wire encoding is postcard.
//!
//! ## Canonicalization
//!
//! Signatures do not cover the wire bytes. The transport may attach
//! incidental metadata, and field order in memory is arbitrary, so the
//! signer and verifier both reduce an envelope to a canonical byte
//! string: the common fields plus a fixed, type-specific allow-list of
//! payload fields, skipping absent values, sorted by field name, and
//! serialized as JSON. The allow-list is the `match` in
//! [`Envelope::signable_content`]: one arm per variant, checked by the
//! compiler when a variant is added.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RoomError, RoomResult};
use crate::identity::{verify_signature, DeviceKeypair};
use crate::types::{now_ms, MessageId, PeerId};

/// One existing room member, as listed inside a `welcome` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// The member's peer id
    pub id: PeerId,
    /// Display name
    pub username: String,
    /// X25519 exchange public key, hex (if known to the host)
    pub epub: Option<String>,
    /// Ed25519 verifying key, hex (if known to the host)
    #[serde(rename = "pub")]
    pub sign: Option<String>,
}

/// One entry of the public-key table carried by `promote-notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyEntry {
    /// The peer these keys belong to
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    /// X25519 exchange public key, hex
    pub epub: String,
    /// Ed25519 verifying key, hex
    #[serde(rename = "pub")]
    pub sign: String,
}

/// Type-specific payload of an envelope: a closed union with one variant
/// per protocol message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Request to enter a room; carries the joiner's public keys and
    /// the salted hash of the room password (if any).
    Join {
        epub: String,
        sign: String,
        username: String,
        password: Option<String>,
    },
    /// Host's answer to an accepted join, addressed to one peer:
    /// the group secret sealed under the pairwise key, plus the list
    /// of existing members.
    Welcome {
        target: PeerId,
        epub: String,
        sign: String,
        username: String,
        encrypted_secret: String,
        peers: Vec<PeerSummary>,
    },
    /// Chat body, encrypted under the current group secret (hex).
    Chat { encrypted: String },
    /// Host's answer to a refused join.
    Reject { target: PeerId, reason: String },
    /// Host orders a peer out of the room.
    Kick { target: PeerId },
    /// Host tells everyone else who was kicked.
    KickNotify { kicked_peer: PeerId },
    /// Host tells existing members about an accepted joiner, including
    /// the joiner's keys so any future host can rekey for them.
    UserJoined {
        new_user: PeerId,
        new_username: String,
        new_user_epub: String,
        new_user_sign: String,
    },
    /// Host handoff. On voluntary handoff the secrets are sealed for
    /// the new host; on self-election after host loss they are absent.
    PromoteNotify {
        old_host: PeerId,
        new_host: PeerId,
        max_users: u32,
        is_public: bool,
        room_name: Option<String>,
        kicked_users: Vec<PeerId>,
        peer_keys: Vec<PeerKeyEntry>,
        encrypted_shared_secret: Option<String>,
        encrypted_room_password: Option<String>,
    },
    /// Fresh group secret after a kick, sealed per remaining peer.
    Rekey {
        encrypted_keys: BTreeMap<PeerId, String>,
    },
    /// Liveness probe.
    Ping,
    /// Probe reply, echoing the probe's envelope id.
    Pong { target: PeerId, ping_id: MessageId },
    /// Host tore the room down.
    RoomDestroyed,
}

impl Payload {
    /// Wire name of this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Join { .. } => "join",
            Payload::Welcome { .. } => "welcome",
            Payload::Chat { .. } => "message",
            Payload::Reject { .. } => "reject",
            Payload::Kick { .. } => "kick",
            Payload::KickNotify { .. } => "kick-notify",
            Payload::UserJoined { .. } => "user-joined",
            Payload::PromoteNotify { .. } => "promote-notify",
            Payload::Rekey { .. } => "rekey",
            Payload::Ping => "ping",
            Payload::Pong { .. } => "pong",
            Payload::RoomDestroyed => "room-destroyed",
        }
    }
}

/// A protocol envelope: common fields plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique message id
    pub id: MessageId,
    /// Peer that created this envelope
    pub sender: PeerId,
    /// Sender wall-clock at creation, milliseconds
    pub timestamp: i64,
    /// Hex Ed25519 signature over the canonical content, if signed
    pub signature: Option<String>,
    /// Type-specific payload
    pub payload: Payload,
}

impl Envelope {
    /// Build an unsigned envelope with a fresh id and current timestamp.
    pub fn new(sender: PeerId, payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            timestamp: now_ms(),
            signature: None,
            payload,
        }
    }

    /// Produce the canonical signable byte string for this envelope.
    ///
    /// Fields are collected into a name-sorted map (BTreeMap) and
    /// serialized as JSON, so two envelopes with identical logical
    /// fields always produce byte-identical content regardless of
    /// in-memory ordering. Absent optional fields are skipped, never
    /// serialized as null.
    pub fn signable_content(&self) -> RoomResult<Vec<u8>> {
        let mut fields: BTreeMap<&'static str, Value> = BTreeMap::new();
        fields.insert("id", Value::String(self.id.to_string()));
        fields.insert("sender", Value::String(self.sender.to_string()));
        fields.insert("timestamp", Value::from(self.timestamp));
        fields.insert("type", Value::String(self.payload.kind().to_string()));

        match &self.payload {
            Payload::Join {
                epub,
                sign,
                username,
                password,
            } => {
                fields.insert("epub", Value::String(epub.clone()));
                fields.insert("pub", Value::String(sign.clone()));
                fields.insert("username", Value::String(username.clone()));
                if let Some(password) = password {
                    fields.insert("password", Value::String(password.clone()));
                }
            }
            Payload::Welcome {
                target,
                epub,
                sign,
                username,
                encrypted_secret,
                peers,
            } => {
                fields.insert("target", Value::String(target.to_string()));
                fields.insert("epub", Value::String(epub.clone()));
                fields.insert("pub", Value::String(sign.clone()));
                fields.insert("username", Value::String(username.clone()));
                fields.insert(
                    "encryptedSecret",
                    Value::String(encrypted_secret.clone()),
                );
                fields.insert("peers", json_value(peers)?);
            }
            Payload::Chat { encrypted } => {
                fields.insert("encrypted", Value::String(encrypted.clone()));
            }
            Payload::Reject { target, reason } => {
                fields.insert("target", Value::String(target.to_string()));
                fields.insert("reason", Value::String(reason.clone()));
            }
            Payload::Kick { target } => {
                fields.insert("target", Value::String(target.to_string()));
            }
            Payload::KickNotify { kicked_peer } => {
                fields.insert("kickedPeer", Value::String(kicked_peer.to_string()));
            }
            Payload::UserJoined {
                new_user,
                new_username,
                new_user_epub,
                new_user_sign,
            } => {
                fields.insert("newUser", Value::String(new_user.to_string()));
                fields.insert("newUsername", Value::String(new_username.clone()));
                fields.insert("newUserEpub", Value::String(new_user_epub.clone()));
                fields.insert("newUserPub", Value::String(new_user_sign.clone()));
            }
            Payload::PromoteNotify {
                old_host,
                new_host,
                max_users,
                is_public,
                room_name,
                kicked_users,
                peer_keys,
                encrypted_shared_secret,
                encrypted_room_password,
            } => {
                fields.insert("oldHost", Value::String(old_host.to_string()));
                fields.insert("newHost", Value::String(new_host.to_string()));
                fields.insert("maxUsers", Value::from(*max_users));
                fields.insert("isPublic", Value::Bool(*is_public));
                if let Some(room_name) = room_name {
                    fields.insert("roomName", Value::String(room_name.clone()));
                }
                fields.insert("kickedUsers", json_value(kicked_users)?);
                fields.insert("peerKeys", json_value(peer_keys)?);
                if let Some(secret) = encrypted_shared_secret {
                    fields.insert("encryptedSharedSecret", Value::String(secret.clone()));
                }
                if let Some(password) = encrypted_room_password {
                    fields.insert("encryptedRoomPassword", Value::String(password.clone()));
                }
            }
            Payload::Rekey { encrypted_keys } => {
                fields.insert("encryptedKeys", json_value(encrypted_keys)?);
            }
            Payload::Ping => {}
            Payload::Pong { target, ping_id } => {
                fields.insert("target", Value::String(target.to_string()));
                fields.insert("pingId", Value::String(ping_id.to_string()));
            }
            Payload::RoomDestroyed => {}
        }

        serde_json::to_vec(&fields)
            .map_err(|e| RoomError::Serialization(format!("Canonicalization failed: {}", e)))
    }

    /// Sign this envelope with the session keypair.
    pub fn sign(mut self, keypair: &DeviceKeypair) -> RoomResult<Self> {
        let content = self.signable_content()?;
        self.signature = Some(keypair.sign(&content));
        Ok(self)
    }

    /// Verify this envelope's signature against a hex Ed25519 key.
    ///
    /// Unsigned envelopes never verify.
    pub fn verify_with(&self, sign_key_hex: &str) -> bool {
        let signature = match &self.signature {
            Some(s) => s,
            None => return false,
        };
        let content = match self.signable_content() {
            Ok(c) => c,
            Err(_) => return false,
        };
        verify_signature(&content, signature, sign_key_hex)
    }

    /// The signing key embedded in first-contact envelopes.
    ///
    /// `join` and `welcome` carry the sender's own verifying key so
    /// they can be verified before any trust exists.
    pub fn embedded_sign_key(&self) -> Option<&str> {
        match &self.payload {
            Payload::Join { sign, .. } => Some(sign),
            Payload::Welcome { sign, .. } => Some(sign),
            _ => None,
        }
    }

    /// Encode for publication to the shared log (postcard).
    pub fn encode(&self) -> RoomResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| RoomError::Serialization(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode an envelope received from the shared log.
    pub fn decode(bytes: &[u8]) -> RoomResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| RoomError::Serialization(format!("Failed to decode envelope: {}", e)))
    }
}

/// Convert a serializable payload field to a JSON value for the
/// canonical map.
fn json_value<T: Serialize>(value: &T) -> RoomResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| RoomError::Serialization(format!("Canonicalization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_payload() -> Payload {
        Payload::Join {
            epub: "aa".repeat(32),
            sign: "bb".repeat(32),
            username: "Love".to_string(),
            password: None,
        }
    }

    #[test]
    fn test_signable_content_deterministic() {
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        let c1 = env.signable_content().unwrap();
        let c2 = env.signable_content().unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_signable_content_skips_absent_fields() {
        let without = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        let content = String::from_utf8(without.signable_content().unwrap()).unwrap();
        assert!(!content.contains("password"));

        let mut with = without.clone();
        with.payload = Payload::Join {
            epub: "aa".repeat(32),
            sign: "bb".repeat(32),
            username: "Love".to_string(),
            password: Some("deadbeef".to_string()),
        };
        let content = String::from_utf8(with.signable_content().unwrap()).unwrap();
        assert!(content.contains("password"));
    }

    #[test]
    fn test_signable_content_is_name_sorted() {
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        let content = String::from_utf8(env.signable_content().unwrap()).unwrap();
        // BTreeMap keys come out sorted; spot-check the relative order
        let id_pos = content.find("\"id\"").unwrap();
        let sender_pos = content.find("\"sender\"").unwrap();
        let ts_pos = content.find("\"timestamp\"").unwrap();
        assert!(id_pos < sender_pos && sender_pos < ts_pos);
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = DeviceKeypair::generate();
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload())
            .sign(&keypair)
            .unwrap();
        assert!(env.verify_with(&keypair.public_keys().sign));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let keypair = DeviceKeypair::generate();
        let mut env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload())
            .sign(&keypair)
            .unwrap();
        env.payload = Payload::Chat {
            encrypted: "00".to_string(),
        };
        assert!(!env.verify_with(&keypair.public_keys().sign));
    }

    #[test]
    fn test_verify_rejects_unsigned() {
        let keypair = DeviceKeypair::generate();
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        assert!(!env.verify_with(&keypair.public_keys().sign));
    }

    #[test]
    fn test_transport_metadata_outside_signature() {
        // Fields not in the allow-list (id aside, the envelope has
        // none beyond signature itself) must not affect the canonical
        // content: re-signing does not change it.
        let keypair = DeviceKeypair::generate();
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        let before = env.signable_content().unwrap();
        let signed = env.sign(&keypair).unwrap();
        let after = signed.signable_content().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let keypair = DeviceKeypair::generate();
        let env = Envelope::new(
            PeerId::from("FIRE-AAA-AAAA"),
            Payload::Pong {
                target: PeerId::from("WAVE-BBB-BBBB"),
                ping_id: MessageId::new(),
            },
        )
        .sign(&keypair)
        .unwrap();

        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.verify_with(&keypair.public_keys().sign));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(join_payload().kind(), "join");
        assert_eq!(
            Payload::Chat {
                encrypted: String::new()
            }
            .kind(),
            "message"
        );
        assert_eq!(Payload::Ping.kind(), "ping");
        assert_eq!(Payload::RoomDestroyed.kind(), "room-destroyed");
    }

    #[test]
    fn test_embedded_sign_key() {
        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), join_payload());
        assert_eq!(env.embedded_sign_key(), Some("bb".repeat(32).as_str()));

        let env = Envelope::new(PeerId::from("FIRE-AAA-AAAA"), Payload::Ping);
        assert_eq!(env.embedded_sign_key(), None);
    }

    #[test]
    fn test_rekey_map_canonical_order() {
        let mut encrypted_keys = BTreeMap::new();
        encrypted_keys.insert(PeerId::from("WAVE-BBB-BBBB"), "22".to_string());
        encrypted_keys.insert(PeerId::from("APEX-AAA-AAAA"), "11".to_string());
        let env = Envelope::new(
            PeerId::from("FIRE-AAA-AAAA"),
            Payload::Rekey { encrypted_keys },
        );
        let content = String::from_utf8(env.signable_content().unwrap()).unwrap();
        let apex = content.find("APEX-AAA-AAAA").unwrap();
        let wave = content.find("WAVE-BBB-BBBB").unwrap();
        assert!(apex < wave);
    }
}
