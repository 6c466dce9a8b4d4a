//! Veilroom Core Library
//!
//! Decentralized, end-to-end encrypted group chat over a replicated,
//! eventually-consistent append-only log.
//!
//! ## Overview
//!
//! There is no server and no privileged process: every peer publishes
//! signed envelopes into a shared per-room log and receives everyone
//! else's, including full history replay on (re)subscription. The
//! protocol engine in this crate turns that weak substrate (no
//! ordering, no delivery guarantees, replayed history) into a
//! consistent room: canonical message signing, pairwise key exchange,
//! group-secret distribution and rotation, membership and liveness
//! tracking, deterministic host failover, replay-safe routing, and
//! latency estimation.
//!
//! ## Core Principles
//!
//! - **Replay-safe by construction**: every envelope id is handled at
//!   most once, and pre-join history is ignored.
//! - **End-to-end encrypted**: chat bodies only ever travel encrypted
//!   under the room's group secret; secrets travel sealed under
//!   pairwise X25519-derived keys.
//! - **Decentralized failover**: when the host vanishes, every peer
//!   independently computes the same successor.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use veilroom_core::{MemoryLog, RoomSession, SessionConfig, SharedLog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let log: Arc<dyn SharedLog> = Arc::new(MemoryLog::new());
//!
//!     // Host a room
//!     let host = RoomSession::create_room(log.clone(), SessionConfig {
//!         username: "Love".into(),
//!         ..Default::default()
//!     })?;
//!
//!     // Join it from another session
//!     let guest = RoomSession::join_room(
//!         log.clone(),
//!         host.room_id(),
//!         None,
//!         SessionConfig::default(),
//!     )?;
//!     let mut events = guest.subscribe();
//!
//!     host.send_message("welcome in!")?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod election;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod listing;
pub mod peers;
pub mod quality;
pub mod router;
pub mod secret;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports
pub use crypto::GroupCrypto;
pub use election::{elect_host, CachedRoomSettings};
pub use envelope::{Envelope, Payload, PeerKeyEntry, PeerSummary};
pub use error::{RoomError, RoomResult};
pub use events::{SessionEvent, SessionStatus};
pub use identity::{DeviceKeypair, KeyBundle, KeyDirectory};
pub use listing::RoomListing;
pub use peers::{PeerDirectory, PeerRecord};
pub use quality::{NetworkQuality, QualityEstimator};
pub use router::{Router, VerifyPolicy};
pub use secret::GroupSecret;
pub use session::{
    public_rooms, ConnectionInfo, NetworkInfo, RoomSession, SessionConfig, DEFAULT_MAX_USERS,
    HEARTBEAT_INTERVAL,
};
pub use transport::{MemoryLog, SharedLog};
pub use types::{MessageId, PeerId, RoomId};
