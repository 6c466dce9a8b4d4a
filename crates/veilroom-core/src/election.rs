//! Host election for involuntary failover
//!
//! When the host disappears there is no election round-trip: every
//! remaining peer independently computes the same winner from its local
//! view of the live-peer set. Views can diverge transiently (the
//! transport replicates lazily), in which case disjoint subsets may
//! elect different hosts; the room self-heals once membership
//! reconciles and a later promote-notify settles who won. This is a
//! known, accepted consistency gap of the decentralized design.

use crate::types::PeerId;

/// Compute the failover winner: the lexicographically smallest peer id
/// among the live peers and ourselves.
///
/// Deterministic given the same view, so peers with a consistent
/// membership view agree without exchanging any messages.
pub fn elect_host<'a>(live: impl IntoIterator<Item = &'a PeerId>, self_id: &'a PeerId) -> PeerId {
    live.into_iter()
        .chain(std::iter::once(self_id))
        .min()
        .cloned()
        .expect("candidate set always contains self")
}

/// Room settings cached from observed promote-notify envelopes, applied
/// if this peer later self-elects.
///
/// The room password is deliberately absent: the departed host cannot
/// hand it off securely, so a self-elected host always starts
/// password-less.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedRoomSettings {
    /// Room capacity
    pub max_users: u32,
    /// Whether the room was publicly listed
    pub is_public: bool,
    /// Public listing name
    pub room_name: Option<String>,
    /// Peers banned from rejoining
    pub kicked_users: Vec<PeerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[test]
    fn test_smallest_peer_wins() {
        // Host "A" departed; "B" and "C" remain. Every survivor
        // computes "B".
        let b = peer("B");
        let c = peer("C");

        // From B's perspective: live = {C}, self = B
        assert_eq!(elect_host([&c], &b), peer("B"));
        // From C's perspective: live = {B}, self = C
        assert_eq!(elect_host([&b], &c), peer("B"));
    }

    #[test]
    fn test_self_can_win() {
        let me = peer("APEX-AAA-AAAA");
        let other = peer("ZOOM-ZZZ-ZZZZ");
        assert_eq!(elect_host([&other], &me), me);
    }

    #[test]
    fn test_alone_elects_self() {
        let me = peer("FIRE-AAA-AAAA");
        assert_eq!(elect_host([], &me), me);
    }

    #[test]
    fn test_order_of_view_is_irrelevant() {
        let me = peer("NOVA-MMM-MMMM");
        let a = peer("APEX-AAA-AAAA");
        let z = peer("ZOOM-ZZZ-ZZZZ");
        assert_eq!(elect_host([&z, &a], &me), elect_host([&a, &z], &me));
    }
}
