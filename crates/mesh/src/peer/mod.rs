//! Peer connection records
//!
//! One [`PeerConnection`] exists per remote participant. Records are owned by
//! the [`ConnectionRegistry`]; everyone else sees [`PeerInfo`] snapshots.

pub mod registry;
pub mod timers;

pub use registry::{CandidateRoute, ConnectionRegistry};
pub use timers::{PeerTimers, TimerKind};

use crate::media::LocalTrack;
use crate::transport::{IceCandidate, PeerTransport};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque identifier of a room participant, stable for the session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tie-break order between two participant IDs
    ///
    /// IDs that both parse as unsigned integers compare numerically, anything
    /// else compares as strings. Numerically equal IDs such as `07` and `7`
    /// fall back to string order. Both sides of a glare evaluate the same
    /// order, so exactly one of them is polite.
    pub fn tie_break(&self, other: &PeerId) -> Ordering {
        match (self.0.parse::<u128>(), other.0.parse::<u128>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }

    /// Whether this side yields (rolls back its own offer) during glare with `remote`
    pub fn is_polite_towards(&self, remote: &PeerId) -> bool {
        self.tie_break(remote) == Ordering::Greater
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies one connection instance; a peer gets a new id each time its
/// connection is recreated, so late events for a replaced transport can be
/// recognised and dropped.
pub type ConnectionId = u64;

/// Which side sent the first offer; fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Aggregate transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, ICE not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover by itself
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Transport shut down
    Closed,
}

/// Offer/answer state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Options fixed when a connection is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Connection replaces one whose repair was exhausted; it never schedules
    /// another recreation of its own until it has connected
    pub recreated: bool,
    /// Connection was opened because the user accepted an invitation
    pub user_accepted: bool,
}

/// Timers whose firing may still bring the connection back
const REPAIR_TIMERS: [TimerKind; 3] = [
    TimerKind::DisconnectDebounce,
    TimerKind::IceRestart,
    TimerKind::AnswerRecovery,
];

/// The registry's record for one remote peer
pub struct PeerConnection {
    pub(crate) peer_id: PeerId,
    pub(crate) id: ConnectionId,
    pub(crate) role: Role,
    pub(crate) connection_state: ConnectionState,
    pub(crate) signaling_state: SignalingState,
    pub(crate) ice_state: IceConnectionState,
    pub(crate) has_ever_connected: bool,
    pub(crate) reconnect_attempts: u32,
    pub(crate) pending_remote_candidates: VecDeque<IceCandidate>,
    pub(crate) remote_description_set: bool,
    pub(crate) created_at: Instant,
    pub(crate) options: OpenOptions,
    pub(crate) screen_tracks: Vec<LocalTrack>,
    pub(crate) relay_candidates: HashMap<u32, IceCandidate>,
    pub(crate) next_relay_seq: u32,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) timers: PeerTimers,
}

impl PeerConnection {
    pub fn new(
        peer_id: PeerId,
        id: ConnectionId,
        role: Role,
        transport: Arc<dyn PeerTransport>,
        options: OpenOptions,
    ) -> Self {
        Self {
            peer_id,
            id,
            role,
            connection_state: ConnectionState::New,
            signaling_state: SignalingState::Stable,
            ice_state: IceConnectionState::New,
            has_ever_connected: false,
            reconnect_attempts: 0,
            pending_remote_candidates: VecDeque::new(),
            remote_description_set: false,
            created_at: Instant::now(),
            options,
            screen_tracks: Vec::new(),
            relay_candidates: HashMap::new(),
            next_relay_seq: 0,
            transport,
            timers: PeerTimers::default(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_screen_share(&self) -> bool {
        !self.screen_tracks.is_empty()
    }

    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            connection_id: self.id,
            role: self.role,
            connection_state: self.connection_state,
            signaling_state: self.signaling_state,
            ice_state: self.ice_state,
            has_ever_connected: self.has_ever_connected,
            reconnect_attempts: self.reconnect_attempts,
            pending_candidates: self.pending_remote_candidates.len(),
            remote_description_set: self.remote_description_set,
            screen_share: self.has_screen_share(),
            recreated: self.options.recreated,
            user_accepted: self.options.user_accepted,
            repair_pending: REPAIR_TIMERS.iter().any(|kind| self.timers.is_pending(*kind)),
            age: self.created_at.elapsed(),
        }
    }

    /// Release everything the record holds
    ///
    /// Timers are aborted first so nothing fires against a closing transport,
    /// then connection-scoped screen tracks are stopped and the transport is
    /// closed.
    pub(crate) fn release(mut self) {
        self.timers.clear();
        for track in self.screen_tracks.drain(..) {
            track.stop();
        }
        self.pending_remote_candidates.clear();
        self.relay_candidates.clear();
        self.transport.close();
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("id", &self.id)
            .field("role", &self.role)
            .field("connection_state", &self.connection_state)
            .field("signaling_state", &self.signaling_state)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a peer's connection
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub signaling_state: SignalingState,
    pub ice_state: IceConnectionState,
    pub has_ever_connected: bool,
    pub reconnect_attempts: u32,
    pub pending_candidates: usize,
    pub remote_description_set: bool,
    pub screen_share: bool,
    pub recreated: bool,
    pub user_accepted: bool,
    /// A debounce, ICE restart or answer recovery is scheduled
    pub repair_pending: bool,
    pub age: Duration,
}
