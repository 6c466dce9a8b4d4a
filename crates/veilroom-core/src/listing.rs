//! Public room listings
//!
//! Hosts of public rooms refresh a listing record in a secondary key
//! space of the shared log alongside their heartbeat. Browsers of the
//! listing prune entries that have gone stale.

use serde::{Deserialize, Serialize};

use crate::types::RoomId;

/// Listing entries older than this are treated as gone (3x the
/// heartbeat interval, for safety).
pub const LISTING_STALE_MS: i64 = 90_000;

/// A public room's advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomListing {
    /// Room to join
    pub room_id: RoomId,
    /// Display name of the room
    pub room_name: String,
    /// Display name of the current host
    pub host_name: String,
    /// Members currently in the room (including the host)
    pub user_count: u32,
    /// Capacity
    pub max_users: u32,
    /// Whether a password is required to join
    pub has_password: bool,
    /// Host wall-clock of the last refresh, milliseconds
    pub last_update: i64,
}

impl RoomListing {
    /// Whether this listing is too old to show.
    pub fn is_stale(&self, now: i64) -> bool {
        now - self.last_update >= LISTING_STALE_MS
    }
}

/// Drop stale listings from a snapshot.
pub fn prune_stale(listings: Vec<RoomListing>, now: i64) -> Vec<RoomListing> {
    listings.into_iter().filter(|l| !l.is_stale(now)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(last_update: i64) -> RoomListing {
        RoomListing {
            room_id: RoomId::from("FIRE-AAA-AAAA"),
            room_name: "Lobby".to_string(),
            host_name: "Love".to_string(),
            user_count: 2,
            max_users: 10,
            has_password: false,
            last_update,
        }
    }

    #[test]
    fn test_fresh_listing_kept() {
        let now = 1_000_000;
        let kept = prune_stale(vec![listing(now - 1_000)], now);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_stale_listing_pruned() {
        let now = 1_000_000;
        let kept = prune_stale(vec![listing(now - LISTING_STALE_MS)], now);
        assert!(kept.is_empty());
    }
}
