//! Shared log transport contract and in-memory reference implementation
//!
//! The engine does not replicate data itself; it publishes envelopes
//! into a per-room, append-only key-value store and receives every
//! current and future value back from a subscription, including a full
//! replay of history for late subscribers, with no ordering guarantee
//! across keys. [`SharedLog`] captures exactly that contract;
//! [`MemoryLog`] is the in-process implementation used by tests and
//! local multi-session setups. Real deployments supply an adapter over
//! their replicated store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RoomResult;
use crate::listing::RoomListing;
use crate::types::{MessageId, RoomId};

/// The replicated append-only store the protocol runs over.
///
/// Semantics required of an implementation:
/// - `publish` is at-least-once; duplicate delivery is legal.
/// - `subscribe` delivers every value already under the room key
///   (history replay) and then every future value, unordered.
/// - A secondary key space holds public room listings; publishing
///   `None` tombstones an entry.
pub trait SharedLog: Send + Sync {
    /// Append an encoded envelope under `room` keyed by `id`.
    fn publish(&self, room: &RoomId, id: &MessageId, bytes: Vec<u8>) -> RoomResult<()>;

    /// Subscribe to all current and future values under `room`.
    fn subscribe(&self, room: &RoomId) -> mpsc::UnboundedReceiver<Vec<u8>>;

    /// Publish or tombstone this room's public listing.
    fn put_listing(&self, room: &RoomId, listing: Option<RoomListing>) -> RoomResult<()>;

    /// Snapshot of all current public listings (staleness pruning is
    /// the caller's concern).
    fn listings(&self) -> Vec<RoomListing>;
}

/// Per-room log state
#[derive(Default)]
struct RoomLog {
    /// Append-only history, in arrival order
    entries: Vec<(MessageId, Vec<u8>)>,
    /// Live subscriber channels
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct MemoryLogInner {
    rooms: HashMap<RoomId, RoomLog>,
    listings: HashMap<RoomId, RoomListing>,
}

/// In-memory [`SharedLog`] for tests and single-process setups.
///
/// Keeps full history per room and replays it to every new subscriber,
/// mirroring the replay behavior of a real replicated store, which is
/// precisely what the router's replay protection exists to survive.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored under a room (test introspection).
    pub fn entry_count(&self, room: &RoomId) -> usize {
        self.inner
            .lock()
            .rooms
            .get(room)
            .map(|r| r.entries.len())
            .unwrap_or(0)
    }
}

impl SharedLog for MemoryLog {
    fn publish(&self, room: &RoomId, id: &MessageId, bytes: Vec<u8>) -> RoomResult<()> {
        let mut inner = self.inner.lock();
        let log = inner.rooms.entry(room.clone()).or_default();

        // Re-publishing the same key overwrites nothing; envelopes are
        // immutable once appended.
        if log.entries.iter().any(|(eid, _)| eid == id) {
            return Ok(());
        }

        debug!(room = %room, id = %id, len = bytes.len(), "Publishing value");
        log.entries.push((*id, bytes.clone()));
        log.subscribers.retain(|tx| tx.send(bytes.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self, room: &RoomId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let log = inner.rooms.entry(room.clone()).or_default();

        // History replay: a new subscriber sees everything already
        // under this room, exactly like a fresh listener on a
        // replicated store.
        for (_, bytes) in &log.entries {
            let _ = tx.send(bytes.clone());
        }
        log.subscribers.push(tx);
        rx
    }

    fn put_listing(&self, room: &RoomId, listing: Option<RoomListing>) -> RoomResult<()> {
        let mut inner = self.inner.lock();
        match listing {
            Some(listing) => {
                inner.listings.insert(room.clone(), listing);
            }
            None => {
                inner.listings.remove(room);
            }
        }
        Ok(())
    }

    fn listings(&self) -> Vec<RoomListing> {
        self.inner.lock().listings.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new()
    }

    #[tokio::test]
    async fn test_subscriber_receives_future_values() {
        let log = MemoryLog::new();
        let room = room();

        let mut rx = log.subscribe(&room);
        log.publish(&room, &MessageId::new(), vec![1, 2, 3]).unwrap();

        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history_replay() {
        let log = MemoryLog::new();
        let room = room();

        log.publish(&room, &MessageId::new(), vec![1]).unwrap();
        log.publish(&room, &MessageId::new(), vec![2]).unwrap();

        let mut rx = log.subscribe(&room);
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_duplicate_key_not_duplicated() {
        let log = MemoryLog::new();
        let room = room();
        let id = MessageId::new();

        log.publish(&room, &id, vec![1]).unwrap();
        log.publish(&room, &id, vec![1]).unwrap();
        assert_eq!(log.entry_count(&room), 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let log = MemoryLog::new();
        let room_a = room();
        let room_b = room();

        log.publish(&room_a, &MessageId::new(), vec![1]).unwrap();
        let mut rx_b = log.subscribe(&room_b);
        log.publish(&room_b, &MessageId::new(), vec![2]).unwrap();

        assert_eq!(rx_b.recv().await, Some(vec![2]));
        assert_eq!(log.entry_count(&room_a), 1);
        assert_eq!(log.entry_count(&room_b), 1);
    }

    #[test]
    fn test_listing_put_and_tombstone() {
        let log = MemoryLog::new();
        let room = room();

        log.put_listing(
            &room,
            Some(RoomListing {
                room_id: room.clone(),
                room_name: "Lobby".to_string(),
                host_name: "Love".to_string(),
                user_count: 1,
                max_users: 10,
                has_password: false,
                last_update: 0,
            }),
        )
        .unwrap();
        assert_eq!(log.listings().len(), 1);

        log.put_listing(&room, None).unwrap();
        assert!(log.listings().is_empty());
    }
}
