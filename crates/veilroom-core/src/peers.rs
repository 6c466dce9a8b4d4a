//! Peer directory: membership, metadata, liveness, join order
//!
//! One [`PeerDirectory`] per session tracks every other member of the
//! room. Records are created when a peer is admitted (join, welcome
//! peer list, user-joined), touched on every verified inbound envelope,
//! and removed on kick, departure, or timeout.
//!
//! Liveness is purely local and time-based: a sweep runs every
//! [`SWEEP_INTERVAL`] and treats any peer silent for longer than
//! [`PEER_TIMEOUT_MS`] as departed. There is no ack-based health check
//! beyond the heartbeat traffic that refreshes last-seen.

use std::collections::HashMap;
use std::time::Duration;

use crate::types::PeerId;

/// A peer is considered departed after this much silence.
pub const PEER_TIMEOUT_MS: i64 = 30_000;

/// How often the timeout sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Threshold for proactively dropping unseen peers while building a
/// welcome (slightly above the heartbeat interval): a new joiner cannot
/// derive keys with a peer that is already unreachable.
pub const STALE_PEER_MS: i64 = 35_000;

/// Metadata for one room member.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    /// Display name
    pub username: String,
    /// Deterministic display color derived from the peer id
    pub color: String,
    /// Local wall-clock when this peer was last heard from, ms
    pub last_seen_at: i64,
}

/// Membership set and per-peer metadata for one room.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: HashMap<PeerId, PeerRecord>,
    join_order: Vec<PeerId>,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a peer, recording metadata and join order.
    ///
    /// Re-admitting an existing peer refreshes the username and
    /// last-seen but keeps its original position in the join order.
    pub fn insert(&mut self, peer: PeerId, username: impl Into<String>, now: i64) {
        let color = color_for(peer.as_str());
        self.records.insert(
            peer.clone(),
            PeerRecord {
                username: username.into(),
                color,
                last_seen_at: now,
            },
        );
        if !self.join_order.contains(&peer) {
            self.join_order.push(peer);
        }
    }

    /// Remove a peer from all tables, returning its record.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.join_order.retain(|p| p != peer);
        self.records.remove(peer)
    }

    /// Update last-seen for a known peer. Unknown peers are ignored.
    pub fn touch(&mut self, peer: &PeerId, now: i64) {
        if let Some(record) = self.records.get_mut(peer) {
            record.last_seen_at = now;
        }
    }

    /// Look up a peer's record
    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    /// Whether this peer is a member
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    /// Number of members (excluding self)
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the room has no other members
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All member ids, in arbitrary order
    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.records.keys()
    }

    /// Iterate over (peer, record) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerRecord)> {
        self.records.iter()
    }

    /// Members in the order they joined
    pub fn join_order(&self) -> &[PeerId] {
        &self.join_order
    }

    /// Peers silent past the departure threshold.
    pub fn expired(&self, now: i64) -> Vec<PeerId> {
        self.records
            .iter()
            .filter(|(_, r)| now - r.last_seen_at > PEER_TIMEOUT_MS)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Peers silent past `threshold_ms` (used with [`STALE_PEER_MS`]
    /// while assembling a welcome).
    pub fn stale(&self, now: i64, threshold_ms: i64) -> Vec<PeerId> {
        self.records
            .iter()
            .filter(|(_, r)| now - r.last_seen_at >= threshold_ms)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Forget everyone (session teardown)
    pub fn clear(&mut self) {
        self.records.clear();
        self.join_order.clear();
    }
}

/// Derive a stable display color from a string.
///
/// Hue is constrained to the warm band (0-60), saturation 70-95%,
/// lightness 60-80%, so every peer gets a readable, vivid color that
/// is identical on every member's screen.
pub fn color_for(s: &str) -> String {
    let mut hash: i32 = 0;
    for c in s.chars() {
        hash = (c as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }

    let hue = (hash % 60).abs();
    let saturation = 70 + ((hash >> 8) % 25).abs();
    let lightness = 60 + ((hash >> 16) % 20).abs();

    format!("hsl({}, {}%, {}%)", hue, saturation, lightness)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[test]
    fn test_insert_and_get() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("FIRE-AAA-AAAA"), "Love", 1_000);

        let record = dir.get(&peer("FIRE-AAA-AAAA")).unwrap();
        assert_eq!(record.username, "Love");
        assert_eq!(record.last_seen_at, 1_000);
        assert!(record.color.starts_with("hsl("));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_join_order_preserved() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("WAVE-BBB-BBBB"), "b", 0);
        dir.insert(peer("APEX-AAA-AAAA"), "a", 0);
        dir.insert(peer("ZOOM-CCC-CCCC"), "c", 0);

        assert_eq!(
            dir.join_order(),
            &[
                peer("WAVE-BBB-BBBB"),
                peer("APEX-AAA-AAAA"),
                peer("ZOOM-CCC-CCCC")
            ]
        );

        // Re-insert does not duplicate or move
        dir.insert(peer("APEX-AAA-AAAA"), "a2", 5);
        assert_eq!(dir.join_order().len(), 3);
        assert_eq!(dir.join_order()[1], peer("APEX-AAA-AAAA"));
    }

    #[test]
    fn test_remove_clears_join_order() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("WAVE-BBB-BBBB"), "b", 0);
        dir.insert(peer("APEX-AAA-AAAA"), "a", 0);

        let removed = dir.remove(&peer("WAVE-BBB-BBBB"));
        assert!(removed.is_some());
        assert_eq!(dir.join_order(), &[peer("APEX-AAA-AAAA")]);
        assert!(!dir.contains(&peer("WAVE-BBB-BBBB")));
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("FIRE-AAA-AAAA"), "Love", 1_000);
        dir.touch(&peer("FIRE-AAA-AAAA"), 2_000);
        assert_eq!(dir.get(&peer("FIRE-AAA-AAAA")).unwrap().last_seen_at, 2_000);

        // Touching an unknown peer is a no-op
        dir.touch(&peer("ZOOM-ZZZ-ZZZZ"), 3_000);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_expired_uses_timeout_threshold() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("FIRE-AAA-AAAA"), "fresh", 100_000);
        dir.insert(peer("WAVE-BBB-BBBB"), "silent", 50_000);

        let now = 100_000 + 1;
        // silent: 50_001ms > 30_000 -> expired; fresh: 1ms -> kept
        let expired = dir.expired(now);
        assert_eq!(expired, vec![peer("WAVE-BBB-BBBB")]);
    }

    #[test]
    fn test_expired_boundary_is_exclusive() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("FIRE-AAA-AAAA"), "edge", 0);
        assert!(dir.expired(PEER_TIMEOUT_MS).is_empty());
        assert_eq!(dir.expired(PEER_TIMEOUT_MS + 1).len(), 1);
    }

    #[test]
    fn test_stale_uses_given_threshold() {
        let mut dir = PeerDirectory::new();
        dir.insert(peer("FIRE-AAA-AAAA"), "old", 0);
        dir.insert(peer("WAVE-BBB-BBBB"), "new", 30_000);

        let stale = dir.stale(STALE_PEER_MS, STALE_PEER_MS);
        assert_eq!(stale, vec![peer("FIRE-AAA-AAAA")]);
    }

    #[test]
    fn test_color_deterministic_and_warm() {
        let c1 = color_for("FIRE-AAA-AAAA");
        let c2 = color_for("FIRE-AAA-AAAA");
        assert_eq!(c1, c2);

        // Parse "hsl(h, s%, l%)" and check the constrained ranges
        let inner = c1
            .trim_start_matches("hsl(")
            .trim_end_matches(')')
            .replace('%', "");
        let parts: Vec<i32> = inner.split(", ").map(|p| p.parse().unwrap()).collect();
        assert!(parts[0] < 60);
        assert!((70..95).contains(&parts[1]));
        assert!((60..80).contains(&parts[2]));
    }
}
