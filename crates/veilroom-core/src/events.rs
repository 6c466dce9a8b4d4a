//! Session events and connection status
//!
//! Consumers subscribe to a broadcast stream of [`SessionEvent`]s
//! instead of polling; the protocol engine emits one event per
//! observable state change.

use std::fmt;

use crate::quality::NetworkQuality;
use crate::types::PeerId;

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No active room
    Disconnected,
    /// Establishing transport subscription / sending join
    Connecting,
    /// Waiting for peers (host) or for the welcome (joiner)
    Waiting,
    /// In the room with a working group secret
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

/// Events emitted by a [`crate::session::RoomSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection status moved; `detail` carries the reason for
    /// disconnections ("Kicked by host", "Room destroyed", ...)
    StatusChanged {
        status: SessionStatus,
        detail: Option<String>,
    },
    /// A decrypted chat message arrived
    MessageReceived {
        sender: PeerId,
        username: String,
        color: String,
        text: String,
    },
    /// A peer entered the room
    PeerJoined { peer_id: PeerId, username: String },
    /// A peer left (timeout or departure)
    PeerLeft { peer_id: PeerId, username: String },
    /// A peer was kicked by the host
    PeerKicked { peer_id: PeerId, username: String },
    /// The room's host changed to another peer
    HostChanged { new_host: PeerId },
    /// This session became the host (handoff or self-election)
    Promoted,
    /// The group secret was rotated
    Rekeyed,
    /// The latency band changed
    QualityChanged {
        quality: NetworkQuality,
        avg_latency_ms: i64,
    },
    /// Our join request was refused
    Rejected { reason: String },
    /// We were kicked from the room
    Kicked,
    /// The host destroyed the room
    RoomDestroyed,
}
