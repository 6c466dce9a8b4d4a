//! Room sessions: the protocol engine's public surface
//!
//! A [`RoomSession`] owns everything one peer needs for one room: its
//! keypair, the membership and key directories, the group secret, the
//! replay filter, the quality estimator, and the timers. Sessions are
//! explicit objects created by the caller (there is no process-wide
//! singleton) and every piece of mutable state sits behind a single
//! mutex, so inbound handling, heartbeats, and the timeout sweep are
//! serialized no matter which task triggers them.
//!
//! ## Task model
//!
//! Three background tasks per session, all owned by the session and
//! aborted as a unit on teardown:
//! - the driver, draining the transport subscription;
//! - the heartbeat (30 s): ping + public-listing refresh;
//! - the timeout sweep (10 s): the failure detector.
//!
//! No lock is held across an await point; all protocol work is
//! synchronous once an envelope is in hand.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{hash_password, stateless};
use crate::election::{elect_host, CachedRoomSettings};
use crate::envelope::{Envelope, Payload, PeerKeyEntry, PeerSummary};
use crate::error::{RoomError, RoomResult};
use crate::events::{SessionEvent, SessionStatus};
use crate::identity::{DeviceKeypair, KeyBundle, KeyDirectory};
use crate::listing::{prune_stale, RoomListing};
use crate::peers::{PeerDirectory, STALE_PEER_MS, SWEEP_INTERVAL};
use crate::quality::QualityEstimator;
use crate::router::{verify_envelope, Router};
use crate::secret::{open_secret, open_string, seal_secret, seal_string, GroupSecret};
use crate::transport::SharedLog;
use crate::types::{now_ms, MessageId, PeerId, RoomId};

/// Heartbeat period; also the cadence of public-listing refreshes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default room capacity (peers beyond the host)
pub const DEFAULT_MAX_USERS: u32 = 10;

/// Hard capacity ceiling
pub const MAX_USERS_LIMIT: u32 = 256;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for creating or joining a room.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name for this peer
    pub username: String,
    /// Room capacity (host only; ignored when joining)
    pub max_users: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            max_users: DEFAULT_MAX_USERS,
        }
    }
}

/// Snapshot of a session's connection state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub is_host: bool,
    pub host: Option<PeerId>,
    pub status: SessionStatus,
    pub peers: Vec<PeerId>,
}

/// Snapshot of the latency estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub quality: crate::quality::NetworkQuality,
    pub avg_latency_ms: Option<i64>,
    pub samples: usize,
}

/// All mutable session state, guarded by one mutex (single-writer).
struct SessionState {
    status: SessionStatus,
    connected: bool,
    closed: bool,
    is_host: bool,
    host_peer: Option<PeerId>,
    username: String,
    max_users: u32,
    password_hash: Option<String>,
    is_public: bool,
    room_name: Option<String>,
    kicked: HashSet<PeerId>,
    cached_settings: Option<CachedRoomSettings>,
    peers: PeerDirectory,
    keys: KeyDirectory,
    secret: Option<GroupSecret>,
    router: Router,
    quality: QualityEstimator,
}

struct SessionInner {
    log: Arc<dyn SharedLog>,
    keypair: DeviceKeypair,
    self_id: PeerId,
    room_id: RoomId,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One peer's participation in one room.
///
/// Cheap to clone; all clones share the same session. Call
/// [`RoomSession::leave`] (or one of the fatal inbound events) to tear
/// the session down; dropping the last handle does not stop the
/// background tasks on its own.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

impl RoomSession {
    /// Create a new room and become its host.
    ///
    /// Generates the session keypair, peer and room ids, and the
    /// initial group secret, then starts listening. The secret is not
    /// transmitted anywhere until a peer joins.
    pub fn create_room(log: Arc<dyn SharedLog>, config: SessionConfig) -> RoomResult<Self> {
        let keypair = DeviceKeypair::generate();
        let self_id = PeerId::new();
        let room_id = RoomId::new();
        let joined_at = now_ms();
        info!(room = %room_id, peer = %self_id, "Creating room");

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            log,
            keypair,
            self_id: self_id.clone(),
            room_id,
            event_tx,
            state: Mutex::new(SessionState {
                status: SessionStatus::Waiting,
                connected: false,
                closed: false,
                is_host: true,
                host_peer: Some(self_id.clone()),
                username: config.username,
                max_users: config.max_users.clamp(1, MAX_USERS_LIMIT),
                password_hash: None,
                is_public: false,
                room_name: None,
                kicked: HashSet::new(),
                cached_settings: None,
                peers: PeerDirectory::new(),
                keys: KeyDirectory::new(),
                secret: Some(GroupSecret::generate()),
                router: Router::new(self_id, joined_at),
                quality: QualityEstimator::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        });

        spawn_tasks(&inner);
        inner.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Waiting,
            detail: None,
        });
        Ok(Self { inner })
    }

    /// Join an existing room.
    ///
    /// Subscribes first, then publishes a signed `join` carrying our
    /// public keys and the salted password hash. The session reaches
    /// `Connected` when the host's `welcome` arrives, or emits
    /// [`SessionEvent::Rejected`] if the host refuses.
    pub fn join_room(
        log: Arc<dyn SharedLog>,
        room_id: RoomId,
        password: Option<&str>,
        config: SessionConfig,
    ) -> RoomResult<Self> {
        let keypair = DeviceKeypair::generate();
        let self_id = PeerId::new();
        let joined_at = now_ms();
        info!(room = %room_id, peer = %self_id, "Joining room");

        let password_hash = password.map(|p| hash_password(p, room_id.as_str()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            log,
            keypair,
            self_id: self_id.clone(),
            room_id,
            event_tx,
            state: Mutex::new(SessionState {
                status: SessionStatus::Connecting,
                connected: false,
                closed: false,
                is_host: false,
                host_peer: None,
                username: config.username.clone(),
                max_users: DEFAULT_MAX_USERS,
                password_hash: None,
                is_public: false,
                room_name: None,
                kicked: HashSet::new(),
                cached_settings: None,
                peers: PeerDirectory::new(),
                keys: KeyDirectory::new(),
                secret: None,
                router: Router::new(self_id, joined_at),
                quality: QualityEstimator::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        });

        spawn_tasks(&inner);

        let bundle = inner.keypair.public_keys();
        inner.send(Payload::Join {
            epub: bundle.exchange,
            sign: bundle.sign,
            username: config.username,
            password: password_hash,
        });

        {
            let mut state = inner.state.lock();
            inner.set_status(&mut state, SessionStatus::Waiting, None);
        }
        Ok(Self { inner })
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Encrypt a chat message under the group secret and publish it.
    pub fn send_message(&self, text: &str) -> RoomResult<()> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(RoomError::NotConnected("session is closed".to_string()));
        }
        let secret = state
            .secret
            .as_ref()
            .ok_or_else(|| RoomError::NotConnected("no group secret yet".to_string()))?;
        let sealed = stateless::encrypt(secret.as_bytes(), text.as_bytes())?;
        drop(state);

        self.inner.send(Payload::Chat {
            encrypted: hex::encode(sealed),
        });
        Ok(())
    }

    /// Kick a peer out of the room (host only).
    ///
    /// Sends a targeted `kick`, a broadcast `kick-notify`, and then
    /// rotates the group secret so the kicked peer cannot read anything
    /// published afterwards.
    pub fn kick_user(&self, peer: &PeerId) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("kick_user".to_string()));
        }
        if !state.peers.contains(peer) {
            return Err(RoomError::PeerNotFound(peer.to_string()));
        }

        state.kicked.insert(peer.clone());
        self.inner.send(Payload::Kick {
            target: peer.clone(),
        });
        self.inner.send(Payload::KickNotify {
            kicked_peer: peer.clone(),
        });

        let record = state.peers.remove(peer);
        state.keys.remove(peer);
        let username = record.map(|r| r.username).unwrap_or_default();
        warn!(peer = %peer, "Kicked peer from room");
        self.inner.emit(SessionEvent::PeerKicked {
            peer_id: peer.clone(),
            username,
        });

        if !state.peers.is_empty() {
            self.inner.rekey_room(&mut state);
        }
        Ok(())
    }

    /// Hand the host role to another peer (host only).
    ///
    /// Requires the target's exchange key; the group secret and the
    /// room password (if set) travel sealed under the pairwise key,
    /// the rest of the room settings and the public-key table travel
    /// in the clear (public keys only).
    pub fn promote_to_host(&self, peer: &PeerId) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("promote_to_host".to_string()));
        }
        let bundle = match state.keys.get(peer) {
            Some(b) => b.clone(),
            None => {
                warn!(peer = %peer, "Cannot promote: missing encryption key");
                return Err(RoomError::Identity(format!(
                    "Missing encryption key for {}",
                    peer
                )));
            }
        };
        let secret = state
            .secret
            .clone()
            .ok_or_else(|| RoomError::NotConnected("no group secret".to_string()))?;

        let sealed_secret = seal_secret(&self.inner.keypair, &bundle.exchange, &secret)?;
        let sealed_password = state
            .password_hash
            .as_deref()
            .map(|p| seal_string(&self.inner.keypair, &bundle.exchange, p))
            .transpose()?;

        let mut kicked_users: Vec<PeerId> = state.kicked.iter().cloned().collect();
        kicked_users.sort();
        let peer_keys = self.inner.peer_key_table(&state, Some(peer));

        self.inner.send(Payload::PromoteNotify {
            old_host: self.inner.self_id.clone(),
            new_host: peer.clone(),
            max_users: state.max_users,
            is_public: state.is_public,
            room_name: state.room_name.clone(),
            kicked_users,
            peer_keys,
            encrypted_shared_secret: Some(sealed_secret),
            encrypted_room_password: sealed_password,
        });

        state.is_host = false;
        state.host_peer = Some(peer.clone());
        info!(new_host = %peer, "Transferred host role");
        self.inner.emit(SessionEvent::HostChanged {
            new_host: peer.clone(),
        });
        Ok(())
    }

    /// Destroy the room (host only): broadcast `room-destroyed`,
    /// force-kick every member, tombstone the listing, tear down.
    pub fn destroy_room(&self) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("destroy_room".to_string()));
        }

        self.inner.send(Payload::RoomDestroyed);
        let members: Vec<PeerId> = state.peers.peer_ids().cloned().collect();
        for peer in members {
            self.inner.send(Payload::Kick { target: peer });
        }
        if state.is_public {
            let _ = self.inner.log.put_listing(&self.inner.room_id, None);
        }

        warn!(room = %self.inner.room_id, "Room destroyed");
        self.inner.emit(SessionEvent::RoomDestroyed);
        self.inner.set_status(
            &mut state,
            SessionStatus::Disconnected,
            Some("Room destroyed".to_string()),
        );
        self.inner.teardown_local(&mut state);
        drop(state);
        self.inner.abort_tasks();
        Ok(())
    }

    /// Set or clear the room password (host only). Stored and compared
    /// as a salted hash; the plaintext never leaves this call.
    pub fn set_room_password(&self, password: Option<&str>) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("set_room_password".to_string()));
        }
        state.password_hash = password.map(|p| hash_password(p, self.inner.room_id.as_str()));
        info!(set = state.password_hash.is_some(), "Room password updated");
        Ok(())
    }

    /// Set room capacity (host only), clamped to 1..=256.
    pub fn set_max_users(&self, max: u32) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("set_max_users".to_string()));
        }
        state.max_users = max.clamp(1, MAX_USERS_LIMIT);
        Ok(())
    }

    /// Publish or withdraw the room from the public listing (host only).
    pub fn set_room_visibility(&self, is_public: bool, room_name: Option<&str>) -> RoomResult<()> {
        let mut state = self.inner.state.lock();
        if !state.is_host {
            return Err(RoomError::NotHost("set_room_visibility".to_string()));
        }
        let was_public = state.is_public;
        state.is_public = is_public;
        state.room_name = room_name.map(|s| s.to_string());

        if is_public {
            self.inner.update_listing(&state);
        } else if was_public {
            let _ = self.inner.log.put_listing(&self.inner.room_id, None);
        }
        Ok(())
    }

    /// Leave the room and tear the session down.
    pub fn leave(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        if state.is_host && state.is_public {
            let _ = self.inner.log.put_listing(&self.inner.room_id, None);
        }
        self.inner
            .set_status(&mut state, SessionStatus::Disconnected, None);
        self.inner.teardown_local(&mut state);
        drop(state);
        self.inner.abort_tasks();
    }

    /// This session's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.inner.self_id.clone()
    }

    /// The room this session belongs to.
    pub fn room_id(&self) -> RoomId {
        self.inner.room_id.clone()
    }

    /// Whether this session currently holds the host role.
    pub fn is_host(&self) -> bool {
        self.inner.state.lock().is_host
    }

    /// Current connection status.
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    /// Connection snapshot.
    pub fn connection_info(&self) -> ConnectionInfo {
        let state = self.inner.state.lock();
        ConnectionInfo {
            peer_id: self.inner.self_id.clone(),
            room_id: self.inner.room_id.clone(),
            is_host: state.is_host,
            host: state.host_peer.clone(),
            status: state.status,
            peers: state.peers.join_order().to_vec(),
        }
    }

    /// Latency estimate snapshot.
    pub fn network_info(&self) -> NetworkInfo {
        let state = self.inner.state.lock();
        NetworkInfo {
            quality: state.quality.quality(),
            avg_latency_ms: state.quality.average(),
            samples: state.quality.samples(),
        }
    }
}

/// Snapshot the public room directory, dropping stale listings.
pub fn public_rooms(log: &dyn SharedLog) -> Vec<RoomListing> {
    prune_stale(log.listings(), now_ms())
}

/// Spawn the driver, heartbeat, and sweep tasks for a session.
fn spawn_tasks(inner: &Arc<SessionInner>) {
    let mut tasks = Vec::with_capacity(3);

    let mut rx = inner.log.subscribe(&inner.room_id);
    let driver = inner.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            driver.handle_raw(&bytes);
        }
        debug!("Transport subscription closed");
    }));

    let heartbeat = inner.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // the first tick fires immediately
        loop {
            interval.tick().await;
            heartbeat.heartbeat_tick();
        }
    }));

    let sweep = inner.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep.sweep_tick();
        }
    }));

    *inner.tasks.lock() = tasks;
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, state: &mut SessionState, status: SessionStatus, detail: Option<String>) {
        if state.status != status || detail.is_some() {
            state.status = status;
            self.emit(SessionEvent::StatusChanged { status, detail });
        }
    }

    /// Sign and publish a payload; returns the envelope id on success.
    fn send(&self, payload: Payload) -> Option<MessageId> {
        let envelope = match Envelope::new(self.self_id.clone(), payload).sign(&self.keypair) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "Failed to sign envelope");
                return None;
            }
        };
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to encode envelope");
                return None;
            }
        };
        if let Err(e) = self.log.publish(&self.room_id, &envelope.id, bytes) {
            warn!(error = %e, "Failed to publish envelope");
            return None;
        }
        Some(envelope.id)
    }

    /// Serialize the known public keys plus our own, excluding `skip`.
    fn peer_key_table(&self, state: &SessionState, skip: Option<&PeerId>) -> Vec<PeerKeyEntry> {
        let mut entries: Vec<PeerKeyEntry> = state
            .keys
            .iter()
            .filter(|(peer, _)| Some(*peer) != skip)
            .map(|(peer, bundle)| PeerKeyEntry {
                peer_id: peer.clone(),
                epub: bundle.exchange.clone(),
                sign: bundle.sign.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let own = self.keypair.public_keys();
        entries.push(PeerKeyEntry {
            peer_id: self.self_id.clone(),
            epub: own.exchange,
            sign: own.sign,
        });
        entries
    }

    /// Refresh the public listing (host of a public room only).
    fn update_listing(&self, state: &SessionState) {
        if !state.is_host || !state.is_public {
            return;
        }
        let listing = RoomListing {
            room_id: self.room_id.clone(),
            room_name: state
                .room_name
                .clone()
                .unwrap_or_else(|| format!("{}'s Room", state.username)),
            host_name: state.username.clone(),
            user_count: state.peers.len() as u32 + 1,
            max_users: state.max_users,
            has_password: state.password_hash.is_some(),
            last_update: now_ms(),
        };
        if let Err(e) = self.log.put_listing(&self.room_id, Some(listing)) {
            warn!(error = %e, "Failed to update public listing");
        }
    }

    /// Heartbeat timer body.
    fn heartbeat_tick(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        // Keep the listing fresh even while waiting for the first peer
        if state.is_host && state.is_public {
            self.update_listing(&state);
        }
        if state.connected {
            if let Some(id) = self.send(Payload::Ping) {
                state.quality.record_ping(id, now_ms());
            }
        }
    }

    /// Timeout-sweep timer body: the failure detector.
    fn sweep_tick(&self) {
        let mut state = self.state.lock();
        if state.closed || !state.connected || state.peers.is_empty() {
            return;
        }
        let now = now_ms();
        for peer in state.peers.expired(now) {
            self.handle_peer_leave(&mut state, &peer);
        }
    }

    fn handle_peer_leave(&self, state: &mut SessionState, peer: &PeerId) {
        let host_left = state.host_peer.as_ref() == Some(peer);
        let record = state.peers.remove(peer);
        state.keys.remove(peer);

        let username = record.map(|r| r.username).unwrap_or_default();
        warn!(peer = %peer, username = %username, "Peer timed out");
        self.emit(SessionEvent::PeerLeft {
            peer_id: peer.clone(),
            username,
        });

        if host_left && !state.is_host {
            self.handle_host_left(state);
        }
    }

    /// Deterministic failover once the host is gone.
    fn handle_host_left(&self, state: &mut SessionState) {
        warn!("Host has disconnected");
        let winner = elect_host(state.peers.peer_ids(), &self.self_id);
        if winner == self.self_id {
            self.self_promote(state);
        } else {
            debug!(winner = %winner, "Waiting for the elected peer to take over");
            state.host_peer = Some(winner.clone());
            self.emit(SessionEvent::HostChanged { new_host: winner });
        }
    }

    /// Become host after winning an involuntary election.
    ///
    /// Restores cached room settings except the password, which the
    /// departed host could not have handed off securely, and announces
    /// the takeover with a promote-notify that carries no encrypted
    /// payload (there is no secure channel from the old host anymore).
    fn self_promote(&self, state: &mut SessionState) {
        info!("Self-promoting to host");
        let old_host = state.host_peer.take().unwrap_or_else(|| self.self_id.clone());
        state.is_host = true;
        state.host_peer = Some(self.self_id.clone());

        match state.cached_settings.take() {
            Some(cached) => {
                state.max_users = cached.max_users.clamp(1, MAX_USERS_LIMIT);
                state.is_public = cached.is_public;
                state.room_name = cached.room_name;
                state.kicked = cached.kicked_users.into_iter().collect();
            }
            None => {
                state.kicked.clear();
            }
        }
        state.password_hash = None;

        self.emit(SessionEvent::Promoted);

        let mut kicked_users: Vec<PeerId> = state.kicked.iter().cloned().collect();
        kicked_users.sort();
        self.send(Payload::PromoteNotify {
            old_host,
            new_host: self.self_id.clone(),
            max_users: state.max_users,
            is_public: state.is_public,
            room_name: state.room_name.clone(),
            kicked_users,
            peer_keys: self.peer_key_table(state, None),
            encrypted_shared_secret: None,
            encrypted_room_password: None,
        });

        if state.is_public {
            self.update_listing(state);
        }
    }

    /// Rotate the group secret and distribute it to every remaining
    /// peer, each entry sealed under that peer's pairwise key.
    fn rekey_room(&self, state: &mut SessionState) {
        info!("Rotating group secret");
        let fresh = GroupSecret::generate();

        let mut encrypted_keys = BTreeMap::new();
        for (peer, bundle) in state.keys.iter() {
            if !state.peers.contains(peer) {
                continue;
            }
            match seal_secret(&self.keypair, &bundle.exchange, &fresh) {
                Ok(sealed) => {
                    encrypted_keys.insert(peer.clone(), sealed);
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to seal rotated secret");
                }
            }
        }

        self.send(Payload::Rekey { encrypted_keys });
        state.secret = Some(fresh);
        self.emit(SessionEvent::Rekeyed);
    }

    /// Purge everything sensitive and mark the session closed.
    fn teardown_local(&self, state: &mut SessionState) {
        state.closed = true;
        state.connected = false;
        state.secret = None;
        state.keys.clear();
        state.peers.clear();
        state.kicked.clear();
        state.cached_settings = None;
        state.host_peer = None;
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Entry point for raw values from the transport subscription.
    fn handle_raw(&self, bytes: &[u8]) {
        match Envelope::decode(bytes) {
            Ok(envelope) => self.handle_envelope(envelope),
            Err(e) => {
                debug!(error = %e, "Dropping undecodable value");
            }
        }
    }

    /// Admission, verification, and dispatch for one envelope.
    fn handle_envelope(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if !state.router.admit(&envelope) {
            return;
        }

        state.peers.touch(&envelope.sender, now_ms());

        if !verify_envelope(&envelope, &state.keys) {
            warn!(
                kind = envelope.payload.kind(),
                sender = %envelope.sender,
                "Dropping envelope with invalid signature"
            );
            return;
        }

        let sender = envelope.sender.clone();
        let envelope_id = envelope.id;
        match envelope.payload {
            Payload::Join {
                epub,
                sign,
                username,
                password,
            } => self.on_join(&mut state, sender, epub, sign, username, password),
            Payload::Welcome {
                target,
                epub,
                sign,
                username,
                encrypted_secret,
                peers,
            } => self.on_welcome(
                &mut state,
                sender,
                target,
                epub,
                sign,
                username,
                encrypted_secret,
                peers,
            ),
            Payload::Chat { encrypted } => self.on_chat(&mut state, sender, encrypted),
            Payload::Reject { target, reason } => {
                self.on_reject(&mut state, target, reason);
            }
            Payload::Kick { target } => self.on_kick(&mut state, target),
            Payload::KickNotify { kicked_peer } => {
                self.on_kick_notify(&mut state, kicked_peer);
            }
            Payload::UserJoined {
                new_user,
                new_username,
                new_user_epub,
                new_user_sign,
            } => self.on_user_joined(
                &mut state,
                new_user,
                new_username,
                new_user_epub,
                new_user_sign,
            ),
            Payload::PromoteNotify {
                old_host: _,
                new_host,
                max_users,
                is_public,
                room_name,
                kicked_users,
                peer_keys,
                encrypted_shared_secret,
                encrypted_room_password,
            } => self.on_promote_notify(
                &mut state,
                sender,
                new_host,
                max_users,
                is_public,
                room_name,
                kicked_users,
                peer_keys,
                encrypted_shared_secret,
                encrypted_room_password,
            ),
            Payload::Rekey { encrypted_keys } => {
                self.on_rekey(&mut state, sender, encrypted_keys);
            }
            Payload::Ping => self.on_ping(sender, envelope_id),
            Payload::Pong { target, ping_id } => {
                self.on_pong(&mut state, target, ping_id);
            }
            Payload::RoomDestroyed => self.on_room_destroyed(&mut state),
        }
    }

    /// Host-side join admission. Non-hosts only observe joins.
    #[allow(clippy::too_many_arguments)]
    fn on_join(
        &self,
        state: &mut SessionState,
        sender: PeerId,
        epub: String,
        sign_key: String,
        username: String,
        password: Option<String>,
    ) {
        if !state.is_host {
            debug!(peer = %sender, "Observed a join request (not host)");
            return;
        }

        if state.kicked.contains(&sender) {
            warn!(peer = %sender, "Rejected join from kicked peer");
            self.send(Payload::Reject {
                target: sender,
                reason: "Kicked from this room".to_string(),
            });
            return;
        }

        if state.peers.len() as u32 >= state.max_users {
            warn!(peer = %sender, "Room full, rejecting join");
            self.send(Payload::Reject {
                target: sender,
                reason: "Room is full".to_string(),
            });
            return;
        }

        if let Some(expected) = &state.password_hash {
            if password.as_deref() != Some(expected.as_str()) {
                warn!(peer = %sender, "Wrong password, rejecting join");
                self.send(Payload::Reject {
                    target: sender,
                    reason: "Incorrect password".to_string(),
                });
                return;
            }
        }

        let now = now_ms();
        info!(peer = %sender, username = %username, "Peer joined");
        state.peers.insert(sender.clone(), username.clone(), now);
        state.keys.insert(
            sender.clone(),
            KeyBundle {
                sign: sign_key.clone(),
                exchange: epub.clone(),
            },
        );
        self.emit(SessionEvent::PeerJoined {
            peer_id: sender.clone(),
            username: username.clone(),
        });

        let secret = match &state.secret {
            Some(s) => s.clone(),
            None => {
                warn!("Cannot welcome peer: no group secret");
                return;
            }
        };
        let sealed_secret = match seal_secret(&self.keypair, &epub, &secret) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Key exchange with joiner failed");
                return;
            }
        };

        // Prune peers the joiner could never reach before forwarding
        // the member list
        for stale in state.peers.stale(now, STALE_PEER_MS) {
            if stale == sender {
                continue;
            }
            info!(peer = %stale, "Dropping stale peer while assembling welcome");
            self.handle_peer_leave(state, &stale);
        }

        let existing: Vec<PeerSummary> = state
            .peers
            .join_order()
            .iter()
            .filter(|p| **p != sender)
            .filter_map(|p| {
                state.peers.get(p).map(|record| PeerSummary {
                    id: p.clone(),
                    username: record.username.clone(),
                    epub: state.keys.get(p).map(|b| b.exchange.clone()),
                    sign: state.keys.get(p).map(|b| b.sign.clone()),
                })
            })
            .collect();

        let own = self.keypair.public_keys();
        self.send(Payload::Welcome {
            target: sender.clone(),
            epub: own.exchange.clone(),
            sign: own.sign.clone(),
            username: state.username.clone(),
            encrypted_secret: sealed_secret,
            peers: existing,
        });

        self.send(Payload::UserJoined {
            new_user: sender,
            new_username: username,
            new_user_epub: epub,
            new_user_sign: sign_key,
        });

        state.connected = true;
        self.set_status(state, SessionStatus::Connected, None);
    }

    /// Joiner-side handling of the host's welcome.
    #[allow(clippy::too_many_arguments)]
    fn on_welcome(
        &self,
        state: &mut SessionState,
        sender: PeerId,
        target: PeerId,
        epub: String,
        sign_key: String,
        username: String,
        encrypted_secret: String,
        peers: Vec<PeerSummary>,
    ) {
        if target != self.self_id {
            return;
        }

        let now = now_ms();
        info!(host = %sender, "Received welcome");
        state.host_peer = Some(sender.clone());

        // Host first in the join order, then the members it listed
        state.peers.insert(sender.clone(), username.clone(), now);
        state.keys.insert(
            sender.clone(),
            KeyBundle {
                sign: sign_key,
                exchange: epub.clone(),
            },
        );
        self.emit(SessionEvent::PeerJoined {
            peer_id: sender,
            username,
        });

        for peer in peers {
            if peer.id == self.self_id || state.peers.contains(&peer.id) {
                continue;
            }
            state
                .peers
                .insert(peer.id.clone(), peer.username.clone(), now);
            if let (Some(peer_epub), Some(peer_sign)) = (peer.epub, peer.sign) {
                state.keys.insert(
                    peer.id.clone(),
                    KeyBundle {
                        sign: peer_sign,
                        exchange: peer_epub,
                    },
                );
            }
            self.emit(SessionEvent::PeerJoined {
                peer_id: peer.id,
                username: peer.username,
            });
        }

        match open_secret(&self.keypair, &epub, &encrypted_secret) {
            Ok(secret) => {
                state.secret = Some(secret);
            }
            Err(e) => {
                warn!(error = %e, "Key exchange with host failed");
            }
        }

        state.connected = true;
        self.set_status(state, SessionStatus::Connected, None);
    }

    /// Decrypt a chat body under the current secret. Failures are
    /// expected after rotations and around history replay, and are
    /// dropped without comment.
    fn on_chat(&self, state: &mut SessionState, sender: PeerId, encrypted: String) {
        let secret = match &state.secret {
            Some(s) => s,
            None => return,
        };
        let sealed = match hex::decode(&encrypted) {
            Ok(b) => b,
            Err(_) => return,
        };
        let plaintext = match stateless::decrypt(secret.as_bytes(), &sealed) {
            Ok(p) => p,
            Err(_) => {
                debug!(sender = %sender, "Chat body not decryptable under current secret");
                return;
            }
        };
        let text = match String::from_utf8(plaintext) {
            Ok(t) => t,
            Err(_) => return,
        };

        let (username, color) = state
            .peers
            .get(&sender)
            .map(|r| (r.username.clone(), r.color.clone()))
            .unwrap_or_else(|| ("Anonymous".to_string(), "#666".to_string()));

        self.emit(SessionEvent::MessageReceived {
            sender,
            username,
            color,
            text,
        });
    }

    fn on_reject(&self, state: &mut SessionState, target: PeerId, reason: String) {
        if target != self.self_id {
            return;
        }
        warn!(reason = %reason, "Join rejected");
        self.emit(SessionEvent::Rejected {
            reason: reason.clone(),
        });
        self.set_status(state, SessionStatus::Disconnected, Some(reason));
        self.teardown_local(state);
        self.abort_tasks();
    }

    fn on_kick(&self, state: &mut SessionState, target: PeerId) {
        if target != self.self_id {
            return;
        }
        warn!("Kicked from the room");
        self.emit(SessionEvent::Kicked);
        self.set_status(
            state,
            SessionStatus::Disconnected,
            Some("Kicked by host".to_string()),
        );
        self.teardown_local(state);
        self.abort_tasks();
    }

    fn on_kick_notify(&self, state: &mut SessionState, kicked_peer: PeerId) {
        if !state.peers.contains(&kicked_peer) {
            return;
        }
        let host_kicked = state.host_peer.as_ref() == Some(&kicked_peer);
        let record = state.peers.remove(&kicked_peer);
        state.keys.remove(&kicked_peer);

        let username = record.map(|r| r.username).unwrap_or_default();
        warn!(peer = %kicked_peer, "Peer was kicked");
        self.emit(SessionEvent::PeerKicked {
            peer_id: kicked_peer,
            username,
        });

        if host_kicked && !state.is_host {
            self.handle_host_left(state);
        }
    }

    fn on_user_joined(
        &self,
        state: &mut SessionState,
        new_user: PeerId,
        new_username: String,
        new_user_epub: String,
        new_user_sign: String,
    ) {
        // The host admitted this peer itself
        if state.is_host {
            return;
        }
        if new_user == self.self_id || state.peers.contains(&new_user) {
            return;
        }

        info!(peer = %new_user, username = %new_username, "Peer joined");
        state
            .peers
            .insert(new_user.clone(), new_username.clone(), now_ms());
        state.keys.insert(
            new_user.clone(),
            KeyBundle {
                sign: new_user_sign,
                exchange: new_user_epub,
            },
        );
        self.emit(SessionEvent::PeerJoined {
            peer_id: new_user,
            username: new_username,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_promote_notify(
        &self,
        state: &mut SessionState,
        sender: PeerId,
        new_host: PeerId,
        max_users: u32,
        is_public: bool,
        room_name: Option<String>,
        kicked_users: Vec<PeerId>,
        peer_keys: Vec<PeerKeyEntry>,
        encrypted_shared_secret: Option<String>,
        encrypted_room_password: Option<String>,
    ) {
        state.host_peer = Some(new_host.clone());

        if new_host == self.self_id {
            info!("Promoted to host");
            state.is_host = true;

            // Secrets only travel on voluntary handoff, sealed for us
            // by the old host
            if let Some(old_host_keys) = state.keys.get(&sender).cloned() {
                if let Some(sealed) = encrypted_shared_secret {
                    match open_secret(&self.keypair, &old_host_keys.exchange, &sealed) {
                        Ok(secret) => state.secret = Some(secret),
                        Err(e) => warn!(error = %e, "Failed to open handed-off secret"),
                    }
                }
                if let Some(sealed) = encrypted_room_password {
                    match open_string(&self.keypair, &old_host_keys.exchange, &sealed) {
                        Ok(password_hash) => state.password_hash = Some(password_hash),
                        Err(e) => warn!(error = %e, "Failed to open handed-off password"),
                    }
                }
            }

            state.max_users = max_users.clamp(1, MAX_USERS_LIMIT);
            state.is_public = is_public;
            state.room_name = room_name;
            state.kicked = kicked_users.into_iter().collect();
            for entry in peer_keys {
                if entry.peer_id == self.self_id {
                    continue;
                }
                state.keys.insert(
                    entry.peer_id,
                    KeyBundle {
                        sign: entry.sign,
                        exchange: entry.epub,
                    },
                );
            }

            self.emit(SessionEvent::Promoted);
            if state.is_public {
                self.update_listing(state);
            }
            return;
        }

        // Everyone else caches the settings (never the password) for a
        // potential future self-election, and keeps the key table
        state.cached_settings = Some(CachedRoomSettings {
            max_users,
            is_public,
            room_name,
            kicked_users,
        });
        for entry in peer_keys {
            if entry.peer_id == self.self_id {
                continue;
            }
            state.keys.insert(
                entry.peer_id,
                KeyBundle {
                    sign: entry.sign,
                    exchange: entry.epub,
                },
            );
        }

        info!(new_host = %new_host, "Host changed");
        self.emit(SessionEvent::HostChanged { new_host });
    }

    fn on_rekey(
        &self,
        state: &mut SessionState,
        sender: PeerId,
        encrypted_keys: BTreeMap<PeerId, String>,
    ) {
        // The host rotated the secret itself
        if state.is_host {
            return;
        }
        let sealed = match encrypted_keys.get(&self.self_id) {
            Some(s) => s,
            None => {
                warn!("Rekey carries no entry for us");
                return;
            }
        };
        let host_keys = match state.keys.get(&sender) {
            Some(b) => b.clone(),
            None => {
                warn!("Cannot open rotated secret: unknown host keys");
                return;
            }
        };
        match open_secret(&self.keypair, &host_keys.exchange, sealed) {
            Ok(secret) => {
                info!("Group secret rotated");
                state.secret = Some(secret);
                self.emit(SessionEvent::Rekeyed);
            }
            Err(e) => {
                warn!(error = %e, "Failed to open rotated secret");
            }
        }
    }

    fn on_ping(&self, sender: PeerId, ping_id: MessageId) {
        self.send(Payload::Pong {
            target: sender,
            ping_id,
        });
    }

    fn on_pong(&self, state: &mut SessionState, target: PeerId, ping_id: MessageId) {
        if target != self.self_id {
            return;
        }
        if let Some((quality, avg)) = state.quality.record_pong(&ping_id, now_ms()) {
            info!(quality = %quality, avg_ms = avg, "Network quality changed");
            self.emit(SessionEvent::QualityChanged {
                quality,
                avg_latency_ms: avg,
            });
        }
    }

    fn on_room_destroyed(&self, state: &mut SessionState) {
        warn!("Room destroyed by host");
        self.emit(SessionEvent::RoomDestroyed);
        self.set_status(
            state,
            SessionStatus::Disconnected,
            Some("Room destroyed".to_string()),
        );
        self.teardown_local(state);
        self.abort_tasks();
    }
}
