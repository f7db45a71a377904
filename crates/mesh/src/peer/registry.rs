//! Connection registry
//!
//! Single source of truth for which peers have a live connection and what
//! state it is in. All access is synchronous; locks are never held across an
//! `.await`, so callers snapshot what they need (a transport handle, a
//! [`PeerInfo`]) and re-check the [`ConnectionId`] after every yield point.

use super::{ConnectionId, PeerConnection, PeerId, PeerInfo, TimerKind};
use crate::event::{EventSender, MeshEvent};
use crate::peer::timers::spawn_delayed;
use crate::transport::{IceCandidate, PeerTransport};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Candidates kept per peer while no connection record exists
pub const MAX_ORPHAN_CANDIDATES: usize = 64;

/// Where an incoming remote candidate went
pub enum CandidateRoute {
    /// Buffered until a remote description is applied
    Queued,
    /// Remote description is set; apply the candidate to this transport now
    Apply(ConnectionId, Arc<dyn PeerTransport>, IceCandidate),
}

/// Owns every [`PeerConnection`] record
pub struct ConnectionRegistry {
    peers: Mutex<HashMap<PeerId, PeerConnection>>,
    orphan_candidates: Mutex<HashMap<PeerId, VecDeque<IceCandidate>>>,
    recreations: Mutex<HashMap<PeerId, AbortHandle>>,
    next_id: AtomicU64,
    events: EventSender,
}

impl ConnectionRegistry {
    /// Create an empty registry whose timers post into `events`
    pub fn new(events: EventSender) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            orphan_candidates: Mutex::new(HashMap::new()),
            recreations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
        }
    }

    /// Allocate a connection id for a record about to be created
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.lock().get(peer_id).map(PeerConnection::info)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    /// Whether `connection_id` is still the live connection for `peer_id`
    pub fn is_current(&self, peer_id: &PeerId, connection_id: ConnectionId) -> bool {
        self.peers
            .lock()
            .get(peer_id)
            .is_some_and(|r| r.id == connection_id)
    }

    pub fn transport(&self, peer_id: &PeerId) -> Option<(ConnectionId, Arc<dyn PeerTransport>)> {
        self.peers
            .lock()
            .get(peer_id)
            .map(|r| (r.id, Arc::clone(&r.transport)))
    }

    /// Install a record, releasing any record it replaces
    ///
    /// Candidates that arrived before any record existed are moved into the
    /// new record's pending queue, and a scheduled recreation for the peer is
    /// cancelled since this record supersedes it. Returns the id of the
    /// replaced connection, if any.
    pub fn put(&self, mut record: PeerConnection) -> Option<ConnectionId> {
        let peer_id = record.peer_id.clone();
        self.cancel_recreation(&peer_id);

        if let Some(orphans) = self.orphan_candidates.lock().remove(&peer_id) {
            debug!(
                "Adopting {} early candidate(s) for peer {}",
                orphans.len(),
                peer_id
            );
            record.pending_remote_candidates.extend(orphans);
        }

        let prior = self.peers.lock().insert(peer_id.clone(), record);
        prior.map(|old| {
            let old_id = old.id;
            info!("Replacing connection {} for peer {}", old_id, peer_id);
            old.release();
            old_id
        })
    }

    /// Remove and release a peer's record; a missing peer is a no-op
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        let removed = self.peers.lock().remove(peer_id);
        removed.map(|record| {
            info!("Removing connection {} for peer {}", record.id, peer_id);
            let info = record.info();
            record.release();
            info
        })
    }

    /// Remove the record only if it is still the given connection
    pub fn remove_if_current(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<PeerInfo> {
        let removed = {
            let mut peers = self.peers.lock();
            let current = peers.get(peer_id).is_some_and(|r| r.id == connection_id);
            if current {
                peers.remove(peer_id)
            } else {
                None
            }
        };
        removed.map(|record| {
            info!("Removing connection {} for peer {}", record.id, peer_id);
            let info = record.info();
            record.release();
            info
        })
    }

    /// Drop everything known about a peer: record, early candidates and any
    /// scheduled recreation
    pub fn forget(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.orphan_candidates.lock().remove(peer_id);
        self.cancel_recreation(peer_id);
        self.remove(peer_id)
    }

    /// Mutate the record if `connection_id` is still current
    pub fn update<R>(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        f: impl FnOnce(&mut PeerConnection) -> R,
    ) -> Option<R> {
        let mut peers = self.peers.lock();
        peers
            .get_mut(peer_id)
            .filter(|r| r.id == connection_id)
            .map(f)
    }

    /// Schedule a peer-scoped timer; returns false if the connection is gone
    pub fn schedule_timer(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        kind: TimerKind,
        delay: Duration,
    ) -> bool {
        let event = MeshEvent::Timer {
            peer_id: peer_id.clone(),
            connection_id,
            kind,
        };
        self.update(peer_id, connection_id, |r| {
            r.timers.schedule(kind, delay, &self.events, event)
        })
        .is_some()
    }

    pub fn cancel_timer(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        kind: TimerKind,
    ) -> bool {
        self.update(peer_id, connection_id, |r| r.timers.cancel(kind))
            .unwrap_or(false)
    }

    pub fn is_timer_pending(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        kind: TimerKind,
    ) -> bool {
        self.update(peer_id, connection_id, |r| r.timers.is_pending(kind))
            .unwrap_or(false)
    }

    /// Queue or hand out a remote candidate
    ///
    /// Candidates are queued while the record has no remote description, or
    /// kept aside when no record exists at all.
    pub fn route_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) -> CandidateRoute {
        {
            let mut peers = self.peers.lock();
            if let Some(record) = peers.get_mut(peer_id) {
                if record.remote_description_set {
                    return CandidateRoute::Apply(
                        record.id,
                        Arc::clone(&record.transport),
                        candidate,
                    );
                }
                record.pending_remote_candidates.push_back(candidate);
                debug!(
                    "Queued candidate for peer {} ({} pending)",
                    peer_id,
                    record.pending_remote_candidates.len()
                );
                return CandidateRoute::Queued;
            }
        }

        let mut orphans = self.orphan_candidates.lock();
        let queue = orphans.entry(peer_id.clone()).or_default();
        if queue.len() >= MAX_ORPHAN_CANDIDATES {
            warn!(
                "Dropping early candidate for peer {}: {} already buffered",
                peer_id,
                queue.len()
            );
        } else {
            queue.push_back(candidate);
            debug!("Buffered early candidate for unknown peer {}", peer_id);
        }
        CandidateRoute::Queued
    }

    /// Mark the remote description as applied and take the pending candidates
    ///
    /// Subsequent calls return an empty list; the queue is drained exactly once
    /// per record. Returns `None` if the connection was replaced meanwhile.
    pub fn take_pending(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<Vec<IceCandidate>> {
        self.update(peer_id, connection_id, |r| {
            r.remote_description_set = true;
            r.pending_remote_candidates.drain(..).collect()
        })
    }

    /// Schedule a full recreation; at most one is pending per peer
    pub fn schedule_recreation(&self, peer_id: &PeerId, delay: Duration) -> bool {
        let mut recreations = self.recreations.lock();
        if recreations
            .get(peer_id)
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!("Recreation already pending for peer {}", peer_id);
            return false;
        }
        let handle = spawn_delayed(
            delay,
            &self.events,
            MeshEvent::Recreate {
                peer_id: peer_id.clone(),
            },
        );
        recreations.insert(peer_id.clone(), handle);
        true
    }

    /// Consume a due recreation; false if it was cancelled meanwhile
    pub fn take_recreation(&self, peer_id: &PeerId) -> bool {
        self.recreations.lock().remove(peer_id).is_some()
    }

    pub fn has_pending_recreation(&self, peer_id: &PeerId) -> bool {
        self.recreations.lock().contains_key(peer_id)
    }

    pub fn cancel_recreation(&self, peer_id: &PeerId) {
        if let Some(handle) = self.recreations.lock().remove(peer_id) {
            handle.abort();
        }
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Every record, sorted by peer id
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.lock().values().map(PeerConnection::info).collect();
        infos.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Release every record and forget all buffered state
    pub fn clear(&self) {
        debug!("Clearing all connections from registry");
        let records: Vec<PeerConnection> = self.peers.lock().drain().map(|(_, r)| r).collect();
        for record in records {
            record.release();
        }
        self.orphan_candidates.lock().clear();
        for (_, handle) in self.recreations.lock().drain() {
            handle.abort();
        }
    }
}
