//! In-memory transport
//!
//! Follows the offer/answer state machine closely enough to reject the same
//! calls a real peer connection rejects, and records everything the mesh
//! does to it. Connection state never changes by itself; tests drive it with
//! [`MockTransport::emit`].

use async_trait::async_trait;
use coderoom_mesh::media::LocalTrack;
use coderoom_mesh::peer::ConnectionId;
use coderoom_mesh::transport::{
    IceCandidate, OfferOptions, PeerTransport, SdpKind, SessionDescription, TransportConfig,
    TransportEvent, TransportEventSink, TransportFactory,
};
use coderoom_mesh::{Error, PeerId, Result, SignalingState};
use parking_lot::Mutex;
use std::sync::Arc;

/// Description produced for every offer and answer
pub const MOCK_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0 111\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 98 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=rtpmap:102 H264/90000\r\n";

struct MockState {
    signaling: SignalingState,
    remote_set: bool,
    offers: Vec<OfferOptions>,
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    rollbacks: usize,
    candidates: Vec<IceCandidate>,
    tracks: Vec<LocalTrack>,
    closed: usize,
}

pub struct MockTransport {
    sink: TransportEventSink,
    config: TransportConfig,
    state: Mutex<MockState>,
}

impl MockTransport {
    fn new(config: TransportConfig, sink: TransportEventSink) -> Self {
        Self {
            sink,
            config,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                remote_set: false,
                offers: Vec::new(),
                local_descriptions: Vec::new(),
                remote_descriptions: Vec::new(),
                rollbacks: 0,
                candidates: Vec::new(),
                tracks: Vec::new(),
                closed: 0,
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.sink.peer_id()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.sink.connection_id()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Report an event to the mesh as the real transport would
    pub fn emit(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    /// Options of every offer created, in order
    pub fn offers(&self) -> Vec<OfferOptions> {
        self.state.lock().offers.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local_descriptions.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed > 0
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    /// Put the transport in a state the mesh did not drive it to
    pub fn force_signaling_state(&self, state: SignalingState) {
        self.state.lock().signaling = state;
    }
}

fn rejected(operation: &str, state: SignalingState) -> Error {
    Error::InvalidState(format!(
        "Cannot {} in signaling state {:?}",
        operation, state
    ))
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(rejected("create offer", state.signaling));
        }
        state.offers.push(options);
        Ok(SessionDescription::offer(MOCK_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(rejected("create answer", state.signaling));
        }
        Ok(SessionDescription::answer(MOCK_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        let next = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveRemoteOffer) => {
                SignalingState::Stable
            }
            (
                SdpKind::Rollback,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer,
            ) => {
                state.rollbacks += 1;
                SignalingState::Stable
            }
            (kind, current) => {
                return Err(rejected(&format!("set local {:?}", kind), current));
            }
        };
        state.signaling = next;
        if description.kind != SdpKind::Rollback {
            state.local_descriptions.push(description);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        let next = match (description.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveLocalOffer) => {
                SignalingState::Stable
            }
            (kind, current) => {
                return Err(rejected(&format!("set remote {:?}", kind), current));
            }
        };
        state.signaling = next;
        state.remote_set = true;
        state.remote_descriptions.push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if !state.remote_set {
            return Err(Error::InvalidState(
                "Cannot add a candidate without a remote description".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        if track.label().contains("broken") {
            return Err(Error::MediaTrackError(format!(
                "Track {} cannot be attached",
                track.label()
            )));
        }
        self.state.lock().tracks.push(track.clone());
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed += 1;
        state.signaling = SignalingState::Closed;
    }
}

/// Builds [`MockTransport`]s and keeps every one it built
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Most recent transport created for `peer_id`
    pub fn latest(&self, peer_id: &PeerId) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.peer_id() == peer_id)
            .cloned()
    }

    /// How many transports were created for `peer_id`
    pub fn created_for(&self, peer_id: &PeerId) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|t| t.peer_id() == peer_id)
            .count()
    }

    pub fn total(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(MockTransport::new(config.clone(), events));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
