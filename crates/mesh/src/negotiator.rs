//! Offer/answer negotiation
//!
//! The negotiator opens transports, runs the offer/answer exchange and moves
//! ICE candidates between the transport and the signaling channel. Glare (both
//! sides offering at once) is resolved by a fixed tie-break: the side whose
//! participant ID is greater is polite and rolls its own offer back, the other
//! side ignores the colliding offer. Both sides evaluate the same rule, so
//! exactly one rollback happens.

use crate::context::MeshContext;
use crate::media::LocalTrack;
use crate::peer::{
    CandidateRoute, ConnectionId, IceConnectionState, OpenOptions, PeerConnection, PeerId, Role,
    SignalingState, TimerKind,
};
use crate::signaling::SignalMessage;
use crate::transport::{
    IceCandidate, OfferOptions, PeerTransport, SessionDescription, TransportEventSink,
};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Drives offer/answer for every peer of one mesh
#[derive(Clone)]
pub(crate) struct Negotiator {
    ctx: Arc<MeshContext>,
}

impl Negotiator {
    pub fn new(ctx: Arc<MeshContext>) -> Self {
        Self { ctx }
    }

    /// Create a transport for `peer_id`, attach local media and install the
    /// record, replacing any previous connection to the peer
    ///
    /// Per-track failures are logged and skipped; a connection without any
    /// local track is still valid. The initiator sends its offer right away.
    #[instrument(skip(self, options), fields(peer_id = %peer_id))]
    pub async fn open(
        &self,
        peer_id: &PeerId,
        role: Role,
        options: OpenOptions,
    ) -> Result<ConnectionId> {
        let id = self.ctx.registry.next_connection_id();
        info!(
            "Opening connection {} to peer {} as {:?}",
            id, peer_id, role
        );

        let sink = TransportEventSink::new(peer_id.clone(), id, self.ctx.events.clone());
        let transport = self
            .ctx
            .transports
            .create(&self.ctx.transport_config(), sink)
            .await?;

        let tracks = self.ctx.media.local_tracks();
        let mut attached = 0;
        for track in tracks.iter() {
            match transport.add_track(track).await {
                Ok(()) => attached += 1,
                Err(e) => warn!(
                    "Skipping {:?} track {} for peer {}: {}",
                    track.kind(),
                    track.id(),
                    peer_id,
                    e
                ),
            }
        }

        let mut record =
            PeerConnection::new(peer_id.clone(), id, role, Arc::clone(&transport), options);

        if let Some(screen) = self.ctx.media.screen_track() {
            let screen = screen.fork();
            match transport.add_track(&screen).await {
                Ok(()) => {
                    attached += 1;
                    record.screen_tracks.push(screen);
                }
                Err(e) => warn!("Skipping screen track for peer {}: {}", peer_id, e),
            }
        }
        debug!("Attached {} local track(s) to connection {}", attached, id);

        self.ctx.registry.put(record);

        if role == Role::Initiator {
            self.send_offer(peer_id, id, false).await?;
        }
        Ok(id)
    }

    /// Create, munge, apply and send an offer on the given connection
    pub async fn send_offer(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        ice_restart: bool,
    ) -> Result<()> {
        let transport = self.current_transport(peer_id, connection_id)?;

        let offer = transport
            .create_offer(OfferOptions { ice_restart })
            .await?;
        let offer = SessionDescription {
            sdp: self.ctx.codecs.apply(&offer.sdp),
            ..offer
        };
        transport.set_local_description(offer.clone()).await?;
        self.sync_signaling(peer_id, connection_id, transport.as_ref());

        debug!(
            "Sending {}offer to peer {}",
            if ice_restart { "ICE-restart " } else { "" },
            peer_id
        );
        self.ctx
            .send(SignalMessage::Offer {
                offer,
                from: None,
                to: Some(peer_id.clone()),
                room_id: self.ctx.room_id.clone(),
                is_restart: ice_restart,
            })
            .await
    }

    /// Apply a remote offer and answer it
    ///
    /// A responder record is created when none exists; `options` applies to
    /// that new record only.
    pub async fn handle_offer(
        &self,
        peer_id: &PeerId,
        offer: SessionDescription,
        is_restart: bool,
        options: OpenOptions,
    ) -> Result<()> {
        let (mut id, mut transport, fresh) = match self.ctx.registry.transport(peer_id) {
            Some((id, transport)) => (id, transport, false),
            None => {
                let id = self.open(peer_id, Role::Responder, options).await?;
                (id, self.current_transport(peer_id, id)?, true)
            }
        };
        debug!(
            "Offer from peer {} on connection {} (restart: {})",
            peer_id, id, is_restart
        );

        if transport.signaling_state() == SignalingState::HaveLocalOffer {
            if self.ctx.local_id.is_polite_towards(peer_id) {
                info!("Offer collision with peer {}: rolling back local offer", peer_id);
                transport
                    .set_local_description(SessionDescription::rollback())
                    .await?;
            } else {
                info!("Offer collision with peer {}: ignoring remote offer", peer_id);
                return Ok(());
            }
        }

        if let Err(e) = transport.set_remote_description(offer.clone()).await {
            if fresh {
                return Err(e);
            }
            warn!(
                "Connection {} rejected offer from peer {} ({}); recreating",
                id, peer_id, e
            );
            id = self.open(peer_id, Role::Responder, options).await?;
            transport = self.current_transport(peer_id, id)?;
            transport.set_remote_description(offer).await?;
        }
        self.sync_signaling(peer_id, id, transport.as_ref());
        self.drain_pending(peer_id, id, transport.as_ref()).await;

        let answer = transport.create_answer().await?;
        let answer = SessionDescription {
            sdp: self.ctx.codecs.apply(&answer.sdp),
            ..answer
        };
        transport.set_local_description(answer.clone()).await?;
        self.sync_signaling(peer_id, id, transport.as_ref());

        debug!("Sending answer to peer {}", peer_id);
        self.ctx
            .send(SignalMessage::Answer {
                answer,
                from: None,
                to: Some(peer_id.clone()),
                room_id: self.ctx.room_id.clone(),
            })
            .await
    }

    /// Apply a remote answer
    ///
    /// Answers on a stable connection are late duplicates and are ignored. An
    /// answer rejected because of the signaling state schedules a recovery
    /// check instead of failing.
    pub async fn handle_answer(&self, peer_id: &PeerId, answer: SessionDescription) -> Result<()> {
        let Some((id, transport)) = self.ctx.registry.transport(peer_id) else {
            debug!("Ignoring answer from peer {} without connection", peer_id);
            return Ok(());
        };

        if transport.signaling_state() == SignalingState::Stable {
            debug!("Ignoring answer from peer {}: already stable", peer_id);
            return Ok(());
        }

        match transport.set_remote_description(answer).await {
            Ok(()) => {}
            Err(e) if e.is_invalid_state() => {
                warn!(
                    "Answer from peer {} rejected in state {:?}: {}",
                    peer_id,
                    transport.signaling_state(),
                    e
                );
                self.ctx.registry.schedule_timer(
                    peer_id,
                    id,
                    TimerKind::AnswerRecovery,
                    self.ctx.config.health.answer_recovery(),
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.sync_signaling(peer_id, id, transport.as_ref());
        self.drain_pending(peer_id, id, transport.as_ref()).await;
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until a remote description exists
    pub async fn handle_ice_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) {
        match self.ctx.registry.route_candidate(peer_id, candidate) {
            CandidateRoute::Queued => {}
            CandidateRoute::Apply(id, transport, candidate) => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!(
                        "Failed to apply candidate from peer {} on connection {}: {}",
                        peer_id, id, e
                    );
                }
            }
        }
    }

    /// Forward a locally gathered candidate; relay candidates are remembered
    /// for one retransmission
    pub async fn on_local_candidate(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        if candidate.is_relay() {
            let seq = self.ctx.registry.update(peer_id, connection_id, |r| {
                let seq = r.next_relay_seq;
                r.next_relay_seq += 1;
                r.relay_candidates.insert(seq, candidate.clone());
                seq
            });
            if let Some(seq) = seq {
                self.ctx.registry.schedule_timer(
                    peer_id,
                    connection_id,
                    TimerKind::RelayRetransmit(seq),
                    self.ctx.config.health.relay_retransmit(),
                );
            }
        }
        self.send_candidate(peer_id, candidate).await
    }

    /// Resend a relay candidate if ICE is still checking
    pub async fn retransmit_relay(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        seq: u32,
    ) -> Result<()> {
        let candidate = self
            .ctx
            .registry
            .update(peer_id, connection_id, |r| {
                let candidate = r.relay_candidates.remove(&seq);
                candidate.filter(|_| r.ice_state == IceConnectionState::Checking)
            })
            .flatten();

        match candidate {
            Some(candidate) => {
                info!("Retransmitting relay candidate {} to peer {}", seq, peer_id);
                self.send_candidate(peer_id, candidate).await
            }
            None => Ok(()),
        }
    }

    /// Renegotiate when the transport asks for it on an established, stable
    /// connection; the first exchange is driven by [`Negotiator::open`]
    pub async fn on_negotiation_needed(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Result<()> {
        let established = self
            .ctx
            .registry
            .update(peer_id, connection_id, |r| r.remote_description_set)
            .unwrap_or(false);
        if !established {
            debug!("Negotiation needed for peer {} before first exchange", peer_id);
            return Ok(());
        }

        let transport = self.current_transport(peer_id, connection_id)?;
        if transport.signaling_state() != SignalingState::Stable {
            debug!("Negotiation needed for peer {} mid-exchange; skipping", peer_id);
            return Ok(());
        }
        self.send_offer(peer_id, connection_id, false).await
    }

    pub fn on_signaling_state(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        state: SignalingState,
    ) {
        self.ctx
            .registry
            .update(peer_id, connection_id, |r| r.signaling_state = state);
    }

    /// Attach a connection-scoped copy of the screen track and renegotiate
    pub async fn attach_screen(&self, peer_id: &PeerId, screen: &LocalTrack) -> Result<()> {
        let (id, transport) = self
            .ctx
            .registry
            .transport(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        let screen = screen.fork();
        transport.add_track(&screen).await?;
        let installed = self
            .ctx
            .registry
            .update(peer_id, id, |r| r.screen_tracks.push(screen.clone()))
            .is_some();
        if !installed {
            screen.stop();
            return Ok(());
        }

        self.on_negotiation_needed(peer_id, id).await
    }

    /// Offer again after an answer could not be applied
    ///
    /// A pending remote offer is rolled back first so the transport can
    /// produce an offer; the offer restarts ICE.
    pub async fn recovery_offer(&self, peer_id: &PeerId, connection_id: ConnectionId) -> Result<()> {
        let transport = self.current_transport(peer_id, connection_id)?;
        if transport.signaling_state() == SignalingState::HaveRemoteOffer {
            transport
                .set_local_description(SessionDescription::rollback())
                .await?;
        }
        info!("Sending recovery offer to peer {}", peer_id);
        self.send_offer(peer_id, connection_id, true).await
    }

    /// Transport of the connection, if it is still the live one
    pub fn current_transport(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Result<Arc<dyn PeerTransport>> {
        match self.ctx.registry.transport(peer_id) {
            Some((id, transport)) if id == connection_id => Ok(transport),
            _ => Err(Error::PeerNotFound(format!(
                "{} (connection {} is gone)",
                peer_id, connection_id
            ))),
        }
    }

    async fn send_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) -> Result<()> {
        self.ctx
            .send(SignalMessage::IceCandidate {
                candidate,
                from: None,
                to: Some(peer_id.clone()),
                room_id: self.ctx.room_id.clone(),
            })
            .await
    }

    /// Apply candidates queued before the remote description, in arrival order
    async fn drain_pending(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        transport: &dyn PeerTransport,
    ) {
        let Some(pending) = self.ctx.registry.take_pending(peer_id, connection_id) else {
            return;
        };
        if !pending.is_empty() {
            debug!(
                "Applying {} queued candidate(s) for peer {}",
                pending.len(),
                peer_id
            );
        }
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued candidate for peer {}: {}", peer_id, e);
            }
        }
    }

    fn sync_signaling(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        transport: &dyn PeerTransport,
    ) {
        self.on_signaling_state(peer_id, connection_id, transport.signaling_state());
    }
}
