//! State shared by the mesh components

use crate::config::MeshConfig;
use crate::coordinator::{CallEvent, Notice};
use crate::event::EventSender;
use crate::ice::IceConfigProvider;
use crate::media::MediaSourceProvider;
use crate::peer::{ConnectionRegistry, PeerId};
use crate::sdp::CodecPreferences;
use crate::signaling::{SignalMessage, SignalingChannel};
use crate::tracks::TrackRouter;
use crate::transport::{TransportConfig, TransportFactory};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Participants currently in the call, as announced by the relay
#[derive(Debug, Default)]
pub struct Roster {
    members: Mutex<HashSet<PeerId>>,
}

impl Roster {
    /// Returns true if the peer was not present before
    pub fn insert(&self, peer_id: PeerId) -> bool {
        self.members.lock().insert(peer_id)
    }

    pub fn remove(&self, peer_id: &PeerId) -> bool {
        self.members.lock().remove(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.members.lock().contains(peer_id)
    }

    pub fn clear(&self) {
        self.members.lock().clear();
    }

    /// Members sorted by id
    pub fn members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self.members.lock().iter().cloned().collect();
        members.sort();
        members
    }
}

/// Collaborators and shared state of one mesh instance
pub(crate) struct MeshContext {
    pub local_id: PeerId,
    pub room_id: String,
    pub config: MeshConfig,
    pub codecs: CodecPreferences,
    pub registry: Arc<ConnectionRegistry>,
    pub roster: Roster,
    pub tracks: TrackRouter,
    pub signaling: Arc<dyn SignalingChannel>,
    pub ice: Arc<dyn IceConfigProvider>,
    pub media: Arc<dyn MediaSourceProvider>,
    pub transports: Arc<dyn TransportFactory>,
    pub events: EventSender,
    pub call_events: mpsc::UnboundedSender<CallEvent>,
}

impl MeshContext {
    /// Transport settings for the next connection
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(self.ice.ice_servers(), self.config.ice_candidate_pool_size)
    }

    pub async fn send(&self, message: SignalMessage) -> Result<()> {
        self.signaling.send(message).await
    }

    pub fn emit(&self, event: CallEvent) {
        // UI side may have gone away; the mesh keeps running without it
        let _ = self.call_events.send(event);
    }

    pub fn notify(&self, notice: Notice) {
        info!("Notice: {}", notice.message());
        self.emit(CallEvent::Notice(notice));
    }

    /// Release a peer's connection, early candidates, pending recreation and
    /// routed streams
    pub fn release_peer(&self, peer_id: &PeerId) {
        self.registry.forget(peer_id);
        self.tracks.release(peer_id);
        self.after_removal();
    }

    /// Apply the auto-stop policy once the last connection is gone
    pub fn after_removal(&self) {
        if !self.config.health.auto_stop_local_media || !self.registry.is_empty() {
            return;
        }
        if !self.media.local_tracks().is_empty() {
            info!("Last connection gone; stopping local media");
            self.media.stop_local();
        }
    }
}
