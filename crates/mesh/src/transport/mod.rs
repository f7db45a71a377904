//! Peer transport abstraction
//!
//! A [`PeerTransport`] is one bidirectional media connection to one remote
//! peer: the offer/answer state machine, ICE and the attached tracks. The
//! mesh only drives it through this trait; [`webrtc::WebRtcTransportFactory`]
//! binds it to webrtc-rs. Transports report what happens to them through a
//! [`TransportEventSink`], which tags each event with the peer and connection
//! it belongs to.

pub mod webrtc;

pub use self::webrtc::WebRtcTransportFactory;

use crate::event::{EventSender, MeshEvent};
use crate::ice::IceServer;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{ConnectionId, ConnectionState, IceConnectionState, PeerId, SignalingState};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Description that returns the transport to `stable`, discarding a local offer
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate type as written in the `typ` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Candidate type parsed from the `typ` attribute
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        match parts.next()? {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.candidate_type() == Some(CandidateType::Relay)
    }
}

/// Track received from a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    pub stream_id: String,
}

/// Something a transport reports about itself
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the remote peer
    LocalCandidate(IceCandidate),
    /// ICE gathering finished
    GatheringComplete,
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    SignalingState(SignalingState),
    /// Remote media arrived
    Track(RemoteTrack),
    /// The transport's tracks changed and it needs a new offer/answer round
    NegotiationNeeded,
}

/// Event sink handed to a transport when it is created
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: PeerId,
    connection_id: ConnectionId,
    events: EventSender,
}

impl TransportEventSink {
    pub fn new(peer_id: PeerId, connection_id: ConnectionId, events: EventSender) -> Self {
        Self {
            peer_id,
            connection_id,
            events,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Post an event to the mesh; dropped silently once the mesh has shut down
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(MeshEvent::Transport {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            event,
        });
    }
}

/// Bundle policy for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// RTCP multiplexing policy for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

/// Everything a factory needs to build one transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    pub ice_candidate_pool_size: u8,
}

impl TransportConfig {
    /// Mesh defaults: max-bundle, rtcp-mux required
    pub fn new(ice_servers: Vec<IceServer>, ice_candidate_pool_size: u8) -> Self {
        Self {
            ice_servers,
            bundle_policy: BundlePolicy::MaxBundle,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            ice_candidate_pool_size,
        }
    }
}

/// Offer creation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    /// Gather fresh ICE credentials
    pub ice_restart: bool,
}

/// One bidirectional media connection
///
/// Every call may fail with [`crate::Error::InvalidState`] when the
/// transport's signaling state does not allow it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local offer, answer or rollback
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Close the transport; must not block and must be safe to call twice
    fn close(&self);
}

/// Builds transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}
