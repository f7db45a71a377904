//! webrtc-rs binding of [`PeerTransport`]
//!
//! Each transport wraps one `RTCPeerConnection`. Local tracks become
//! `TrackLocalStaticSample`s; the factory keeps a weak index of them so the
//! application can feed one sample to every connection a local track is
//! attached to with [`WebRtcTransportFactory::write_sample`].

use super::{
    BundlePolicy, IceCandidate, OfferOptions, PeerTransport, RemoteTrack, RtcpMuxPolicy, SdpKind,
    SessionDescription, TransportConfig, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::ice::IceServer;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{ConnectionState, IceConnectionState, PeerId, SignalingState};
use crate::{Error, Result};
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use ::webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use ::webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::media::Sample;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use ::webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_local::TrackLocal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// Outbound sample tracks by the local track they carry
#[derive(Default)]
struct OutboundTracks {
    entries: Mutex<Vec<(LocalTrack, Weak<TrackLocalStaticSample>)>>,
}

impl OutboundTracks {
    fn register(&self, source: &LocalTrack, track: &Arc<TrackLocalStaticSample>) {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.push((source.clone(), Arc::downgrade(track)));
    }

    /// Live sample tracks carrying `source` or a fork of it
    fn targets(&self, source: &LocalTrack) -> Vec<Arc<TrackLocalStaticSample>> {
        self.entries
            .lock()
            .iter()
            .filter(|(local, _)| {
                !local.is_stopped()
                    && local.kind() == source.kind()
                    && local.stream_id() == source.stream_id()
            })
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

/// Builds [`WebRtcTransport`]s sharing one webrtc-rs API instance
pub struct WebRtcTransportFactory {
    api: API,
    outbound: Arc<OutboundTracks>,
}

impl WebRtcTransportFactory {
    /// Create a factory with the default codecs (Opus, VP8, VP9, H.264) and
    /// default interceptors
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self {
            api,
            outbound: Arc::new(OutboundTracks::default()),
        })
    }

    /// Write one encoded sample to every connection carrying `track`
    ///
    /// Returns the number of connections written to.
    pub async fn write_sample(&self, track: &LocalTrack, sample: &Sample) -> Result<usize> {
        let targets = self.outbound.targets(track);
        for target in &targets {
            target.write_sample(sample).await.map_err(|e| {
                Error::MediaTrackError(format!("Failed to write sample to {}: {}", track.id(), e))
            })?;
        }
        Ok(targets.len())
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[instrument(skip(self, config, events), fields(peer_id = %events.peer_id()))]
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            bundle_policy: to_rtc_bundle_policy(config.bundle_policy),
            rtcp_mux_policy: to_rtc_rtcp_mux_policy(config.rtcp_mux_policy),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        install_handlers(&pc, &events);
        debug!(
            "Created peer connection {} for peer {}",
            events.connection_id(),
            events.peer_id()
        );

        Ok(Arc::new(WebRtcTransport {
            peer_id: events.peer_id().clone(),
            pc,
            tracks: Mutex::new(Vec::new()),
            outbound: Arc::clone(&self.outbound),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Forward every peer connection callback to the mesh as a [`TransportEvent`]
fn install_handlers(pc: &RTCPeerConnection, events: &TransportEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(TransportEvent::LocalCandidate(from_rtc_candidate(init))),
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        if state == RTCIceGathererState::Complete {
            sink.emit(TransportEvent::GatheringComplete);
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        sink.emit(TransportEvent::ConnectionState(from_rtc_connection_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        sink.emit(TransportEvent::IceConnectionState(from_rtc_ice_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        sink.emit(TransportEvent::SignalingState(from_rtc_signaling_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        match kind {
            Some(kind) => {
                let id = track.id();
                sink.emit(TransportEvent::Track(RemoteTrack {
                    label: id.clone(),
                    id,
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            None => warn!("Ignoring remote track {} of unknown kind", track.id()),
        }
        Box::pin(async {})
    }));
}

/// One webrtc-rs peer connection
pub struct WebRtcTransport {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    /// Keeps attached sample tracks alive for the factory's weak index
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    outbound: Arc<OutboundTracks>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    /// Build the webrtc-rs description, including rollbacks
    ///
    /// webrtc-rs refuses a rollback without SDP, so a local rollback carries
    /// the pending local offer.
    async fn to_rtc_description(
        &self,
        description: SessionDescription,
        local: bool,
    ) -> Result<RTCSessionDescription> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                let pending = if local {
                    self.pc.pending_local_description().await
                } else {
                    self.pc.pending_remote_description().await
                };
                let sdp = pending.map(|d| d.sdp).unwrap_or(description.sdp);
                return serde_json::from_value(serde_json::json!({
                    "type": "rollback",
                    "sdp": sdp,
                }))
                .map_err(|e| Error::SdpError(format!("Failed to build rollback: {}", e)));
            }
        };
        parsed.map_err(|e| Error::SdpError(format!("Failed to parse description: {}", e)))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart: options.ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| map_signaling_error("Failed to create offer", e))?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| map_signaling_error("Failed to create answer", e))?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = self.to_rtc_description(description, true).await?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| map_signaling_error("Failed to set local description", e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = self.to_rtc_description(description, false).await?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| map_signaling_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let sample_track = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{}-{}", track.label(), track.id()),
            track.stream_id().to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {:?} track: {}", track.kind(), e))
            })?;

        self.outbound.register(track, &sample_track);
        self.tracks.lock().push(sample_track);
        debug!("Added {:?} track {} for peer {}", track.kind(), track.id(), self.peer_id);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        from_rtc_signaling_state(self.pc.signaling_state())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing peer connection for peer {}", self.peer_id);
        self.tracks.lock().clear();

        let pc = Arc::clone(&self.pc);
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                debug!("Peer connection for {} closed with error: {}", peer_id, e);
            }
        });
    }
}

/// Rejections caused by the signaling state become [`Error::InvalidState`]
fn map_signaling_error(context: &str, e: ::webrtc::Error) -> Error {
    let message = format!("{}: {}", context, e);
    if e.to_string().to_lowercase().contains("signaling state") {
        Error::InvalidState(message)
    } else {
        Error::SdpError(message)
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    #[allow(clippy::needless_update)]
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_bundle_policy(policy: BundlePolicy) -> RTCBundlePolicy {
    match policy {
        BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
        BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
    }
}

fn to_rtc_rtcp_mux_policy(policy: RtcpMuxPolicy) -> RTCRtcpMuxPolicy {
    match policy {
        RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
        RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn from_rtc_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn from_rtc_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            from_rtc_connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            from_rtc_connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            from_rtc_ice_state(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
        assert_eq!(
            from_rtc_signaling_state(RTCSignalingState::HaveLocalPranswer),
            SignalingState::HaveRemoteOffer
        );
        assert_eq!(
            from_rtc_signaling_state(RTCSignalingState::Stable),
            SignalingState::Stable
        );
    }

    #[test]
    fn test_ice_server_conversion() {
        let stun = to_rtc_ice_server(&IceServer::stun("stun:stun.l.google.com:19302"));
        assert_eq!(stun.urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(stun.username.is_empty());

        let turn = to_rtc_ice_server(&IceServer::turn("turn:relay.example.com", "u", "p"));
        assert_eq!(turn.username, "u");
        assert_eq!(turn.credential, "p");
    }

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(from_rtc_candidate(init), candidate);
    }

    #[test]
    fn test_policy_mapping() {
        assert_eq!(
            to_rtc_bundle_policy(BundlePolicy::MaxBundle),
            RTCBundlePolicy::MaxBundle
        );
        assert_eq!(
            to_rtc_rtcp_mux_policy(RtcpMuxPolicy::Require),
            RTCRtcpMuxPolicy::Require
        );
    }

    #[tokio::test]
    async fn test_offer_carries_attached_tracks() {
        let factory = WebRtcTransportFactory::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new(PeerId::from("b"), 1, tx);

        let transport = factory
            .create(&TransportConfig::new(Vec::new(), 0), sink)
            .await
            .unwrap();
        let microphone = LocalTrack::microphone("stream-1");
        transport.add_track(&microphone).await.unwrap();
        transport.add_track(&LocalTrack::camera("stream-1")).await.unwrap();

        let offer = transport.create_offer(OfferOptions::default()).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert_eq!(transport.signaling_state(), SignalingState::Stable);

        assert_eq!(factory.outbound.targets(&microphone).len(), 1);
        microphone.stop();
        assert!(factory.outbound.targets(&microphone).is_empty());

        transport.close();
        transport.close();
    }
}
