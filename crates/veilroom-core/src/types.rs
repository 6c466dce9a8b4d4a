//! Core identifier types for Veilroom

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Alphabet for readable ids, with easily-confused characters removed
/// (no 0/O, no 1/I).
const ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Leading words for readable ids
const ID_WORDS: [&str; 20] = [
    "FIRE", "BOLT", "WAVE", "STAR", "NOVA", "DASH", "GLOW", "ZOOM", "APEX", "CYAN", "ECHO",
    "FLEX", "VOLT", "ZETA", "BLUR", "RUSH", "FURY", "BEAM", "NEON", "PEAK",
];

/// Generate a readable id like `FIRE-3K7-WXYZ`.
///
/// Collision probability across a room's lifetime is negligible:
/// 20 * 32^7 possible values.
fn readable_id() -> String {
    let mut rng = rand::rng();
    let word = ID_WORDS[rng.random_range(0..ID_WORDS.len())];
    let mut segment1 = String::with_capacity(3);
    let mut segment2 = String::with_capacity(4);
    for _ in 0..3 {
        segment1.push(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char);
    }
    for _ in 0..4 {
        segment2.push(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char);
    }
    format!("{}-{}-{}", word, segment1, segment2)
}

/// Unique identifier for a peer in a room.
///
/// Human-readable (`WORD-XXX-XXXX`) so it can be shown, spoken, or typed.
/// Ordering is lexicographic, which host election relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random PeerId
    pub fn new() -> Self {
        Self(readable_id())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a room.
///
/// Same readable format as [`PeerId`]; a room id is minted by the host
/// at creation time alongside its own peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a new random RoomId
    pub fn new() -> Self {
        Self(readable_id())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for an envelope.
///
/// ULIDs carry 80 bits of randomness, so ids are globally unique per
/// sender with overwhelming probability; the replay filter depends on
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Envelope timestamps are sender wall-clock; peers only ever compare
/// them against their own clock with a grace window.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_format() {
        let id = PeerId::new();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ID_WORDS.contains(&parts[0]));
        assert_eq!(parts[1].len(), 3);
        assert_eq!(parts[2].len(), 4);
        for c in parts[1].chars().chain(parts[2].chars()) {
            assert!(ID_ALPHABET.contains(&(c as u8)), "unexpected char {}", c);
        }
    }

    #[test]
    fn test_peer_ids_unique() {
        let a = PeerId::new();
        let b = PeerId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        let a = PeerId::from("APEX-AAA-AAAA");
        let b = PeerId::from("BOLT-AAA-AAAA");
        assert!(a < b);
    }

    #[test]
    fn test_message_ids_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_now_ms_is_milliseconds() {
        let t = now_ms();
        // Sometime after 2020 and before 2100, in milliseconds
        assert!(t > 1_577_836_800_000);
        assert!(t < 4_102_444_800_000);
    }
}
