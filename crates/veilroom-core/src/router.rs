//! Inbound message admission: replay protection and verification policy
//!
//! The shared log replays full history to every subscriber and offers
//! no ordering, so admission is a correctness requirement, not an
//! optimization: without it a reconnecting peer would re-execute every
//! historical side effect (re-join, re-kick, re-elect).
//!
//! Admission pipeline per inbound envelope:
//! 1. Structural check (decode already guarantees the fields exist;
//!    an empty sender is still rejected).
//! 2. Replay/origin filter: drop already-processed ids, drop envelopes
//!    predating our join (minus a grace window for clock skew), drop
//!    our own publications echoed back.
//! 3. Mark the id processed *before* any side effect, making handling
//!    at-most-once per envelope id by construction.
//!
//! Signature requirements then depend on the message type; see
//! [`verify_policy`].

use std::collections::HashSet;

use tracing::debug;

use crate::envelope::{Envelope, Payload};
use crate::identity::KeyDirectory;
use crate::types::{MessageId, PeerId};

/// Tolerated clock skew when rejecting pre-join history.
pub const JOIN_GRACE_MS: i64 = 5_000;

/// How a message type's signature must be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// First-contact types carry the sender's own key; verify against
    /// the directory entry if one exists, else the embedded key.
    EmbeddedKey,
    /// Heartbeats are tolerated from senders whose keys we do not have
    /// yet; verified only when the key is known.
    IfKnown,
    /// Everything else requires a known sender key.
    RequireKnown,
}

/// Verification policy for a payload type.
pub fn verify_policy(payload: &Payload) -> VerifyPolicy {
    match payload {
        Payload::Join { .. } | Payload::Welcome { .. } => VerifyPolicy::EmbeddedKey,
        Payload::Ping | Payload::Pong { .. } => VerifyPolicy::IfKnown,
        _ => VerifyPolicy::RequireKnown,
    }
}

/// Apply the policy to one envelope.
pub fn verify_envelope(env: &Envelope, keys: &KeyDirectory) -> bool {
    let known = keys.get(&env.sender).map(|b| b.sign.as_str());
    match verify_policy(&env.payload) {
        VerifyPolicy::EmbeddedKey => match known.or_else(|| env.embedded_sign_key()) {
            Some(key) => env.verify_with(key),
            None => false,
        },
        VerifyPolicy::IfKnown => match known {
            Some(key) => env.verify_with(key),
            None => true,
        },
        VerifyPolicy::RequireKnown => match known {
            Some(key) => env.verify_with(key),
            None => false,
        },
    }
}

/// Replay and origin filter for one session.
///
/// The processed set only grows; it is bounded by the session's
/// lifetime, which is acceptable for a chat session and documented as a
/// memory-growth characteristic.
#[derive(Debug)]
pub struct Router {
    self_id: PeerId,
    joined_at: i64,
    processed: HashSet<MessageId>,
}

impl Router {
    /// Create a router for a session that joined at `joined_at` (ms).
    pub fn new(self_id: PeerId, joined_at: i64) -> Self {
        Self {
            self_id,
            joined_at,
            processed: HashSet::new(),
        }
    }

    /// Decide whether an envelope should be handled.
    ///
    /// Returns false for structural rejects, pre-join history, replays,
    /// and our own echoes. A true result also marks the id as
    /// processed, so a second delivery of the same id returns false.
    pub fn admit(&mut self, env: &Envelope) -> bool {
        if env.sender.as_str().is_empty() {
            debug!(id = %env.id, "Dropping envelope with empty sender");
            return false;
        }

        // Pre-join history (the log replays everything to us)
        if env.timestamp < self.joined_at - JOIN_GRACE_MS {
            return false;
        }

        // At-most-once per envelope id
        if !self.processed.insert(env.id) {
            return false;
        }

        // Our own publications come back from the log too
        if env.sender == self.self_id {
            return false;
        }

        true
    }

    /// Number of envelope ids seen so far.
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceKeypair;
    use crate::types::now_ms;

    fn ping_from(sender: &str) -> Envelope {
        Envelope::new(PeerId::from(sender), Payload::Ping)
    }

    #[test]
    fn test_admit_marks_processed() {
        let mut router = Router::new(PeerId::from("ME"), now_ms() - 1_000);
        let env = ping_from("OTHER");

        assert!(router.admit(&env));
        // Same id again: idempotent drop
        assert!(!router.admit(&env));
        assert_eq!(router.processed_count(), 1);
    }

    #[test]
    fn test_pre_join_history_rejected() {
        let joined_at = now_ms();
        let mut router = Router::new(PeerId::from("ME"), joined_at);

        let mut env = ping_from("OTHER");
        env.timestamp = joined_at - JOIN_GRACE_MS - 1;
        assert!(!router.admit(&env));

        // Within the grace window is tolerated
        let mut env = ping_from("OTHER");
        env.timestamp = joined_at - JOIN_GRACE_MS + 1;
        assert!(router.admit(&env));
    }

    #[test]
    fn test_own_echo_rejected() {
        let mut router = Router::new(PeerId::from("ME"), now_ms() - 1_000);
        let env = ping_from("ME");
        assert!(!router.admit(&env));
        // The echo still consumed its id slot
        assert_eq!(router.processed_count(), 1);
    }

    #[test]
    fn test_empty_sender_rejected() {
        let mut router = Router::new(PeerId::from("ME"), now_ms() - 1_000);
        let env = ping_from("");
        assert!(!router.admit(&env));
        assert_eq!(router.processed_count(), 0);
    }

    #[test]
    fn test_verify_policy_by_type() {
        assert_eq!(
            verify_policy(&Payload::Join {
                epub: String::new(),
                sign: String::new(),
                username: String::new(),
                password: None
            }),
            VerifyPolicy::EmbeddedKey
        );
        assert_eq!(verify_policy(&Payload::Ping), VerifyPolicy::IfKnown);
        assert_eq!(
            verify_policy(&Payload::Chat {
                encrypted: String::new()
            }),
            VerifyPolicy::RequireKnown
        );
        assert_eq!(
            verify_policy(&Payload::RoomDestroyed),
            VerifyPolicy::RequireKnown
        );
    }

    #[test]
    fn test_join_verifies_with_embedded_key() {
        let keypair = DeviceKeypair::generate();
        let bundle = keypair.public_keys();
        let env = Envelope::new(
            PeerId::from("NEW-PEER"),
            Payload::Join {
                epub: bundle.exchange.clone(),
                sign: bundle.sign.clone(),
                username: "Love".to_string(),
                password: None,
            },
        )
        .sign(&keypair)
        .unwrap();

        // No directory entry; embedded key carries the trust
        let keys = KeyDirectory::new();
        assert!(verify_envelope(&env, &keys));
    }

    #[test]
    fn test_unknown_sender_ping_tolerated_chat_rejected() {
        let keypair = DeviceKeypair::generate();
        let keys = KeyDirectory::new();

        let ping = Envelope::new(PeerId::from("UNKNOWN"), Payload::Ping)
            .sign(&keypair)
            .unwrap();
        assert!(verify_envelope(&ping, &keys));

        let chat = Envelope::new(
            PeerId::from("UNKNOWN"),
            Payload::Chat {
                encrypted: "00".to_string(),
            },
        )
        .sign(&keypair)
        .unwrap();
        assert!(!verify_envelope(&chat, &keys));
    }

    #[test]
    fn test_known_sender_bad_signature_rejected() {
        let real = DeviceKeypair::generate();
        let imposter = DeviceKeypair::generate();
        let sender = PeerId::from("WAVE-BBB-BBBB");

        let mut keys = KeyDirectory::new();
        keys.insert(sender.clone(), real.public_keys());

        let forged = Envelope::new(
            sender,
            Payload::Chat {
                encrypted: "00".to_string(),
            },
        )
        .sign(&imposter)
        .unwrap();
        assert!(!verify_envelope(&forged, &keys));
    }
}
