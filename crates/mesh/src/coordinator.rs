//! Room call coordinator
//!
//! [`RoomCallCoordinator`] is the mesh's event loop. Signaling messages,
//! transport events, timers and application commands all arrive on channels
//! and are handled one at a time, so no two handlers ever interleave.
//! Applications talk to a running coordinator through a cloneable
//! [`MeshHandle`] and receive [`CallEvent`]s for the UI.

use crate::config::MeshConfig;
use crate::context::{MeshContext, Roster};
use crate::error::MediaError;
use crate::event::{EventReceiver, MeshEvent};
use crate::health::HealthSupervisor;
use crate::ice::IceConfigProvider;
use crate::media::{MediaConstraints, MediaSourceProvider};
use crate::negotiator::Negotiator;
use crate::peer::timers::spawn_delayed;
use crate::peer::{ConnectionRegistry, ConnectionState, OpenOptions, PeerId, PeerInfo, Role};
use crate::sdp::CodecPreferences;
use crate::signaling::{Participant, SignalMessage, SignalingChannel};
use crate::tracks::{RoutedStream, StreamKind, TrackRouter};
use crate::transport::{TransportEvent, TransportFactory};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Something the UI should know about
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// A participant wants to call and we have no media running yet
    IncomingCall {
        peer_id: PeerId,
        user_name: Option<String>,
    },
    /// A remote stream was created or gained a track
    StreamUpdated(RoutedStream),
    /// A remote stream went away
    StreamRemoved { peer_id: PeerId, kind: StreamKind },
    Notice(Notice),
}

/// User-facing notice
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ConnectionSlow { peer_id: PeerId },
    ConnectionLost { peer_id: PeerId },
    /// A call the user accepted never connected
    CallFailed { peer_id: PeerId },
    NegotiationFailed { peer_id: PeerId },
    MediaUnavailable(MediaError),
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::ConnectionSlow { peer_id } => {
                format!("Connection to {} is slow, still trying", peer_id)
            }
            Notice::ConnectionLost { peer_id } => {
                format!("Connection to {} lost, you may need to refresh", peer_id)
            }
            Notice::CallFailed { peer_id } => format!("Could not connect the call with {}", peer_id),
            Notice::NegotiationFailed { peer_id } => {
                format!("Call setup with {} failed, you may need to refresh", peer_id)
            }
            Notice::MediaUnavailable(e) => e.user_message(),
        }
    }

    /// How long the UI should show the notice; `None` means until dismissed
    pub fn auto_dismiss(&self) -> Option<Duration> {
        match self {
            Notice::ConnectionSlow { .. } => Some(Duration::from_secs(4)),
            Notice::ConnectionLost { .. }
            | Notice::CallFailed { .. }
            | Notice::NegotiationFailed { .. } => Some(Duration::from_secs(5)),
            Notice::MediaUnavailable(_) => None,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Application request to a running coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartCall,
    AcceptCall(PeerId),
    DeclineCall(PeerId),
    ShareScreen,
    LeaveCall,
    StopLocalMedia,
    Shutdown,
}

/// Cloneable handle to a running coordinator
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<ConnectionRegistry>,
}

impl MeshHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|e| Error::InternalError(format!("Mesh is not running: {:?}", e.0)))
    }

    /// Acquire local media and announce readiness to the room
    pub fn start_call(&self) -> Result<()> {
        self.send(Command::StartCall)
    }

    pub fn accept_call(&self, peer_id: PeerId) -> Result<()> {
        self.send(Command::AcceptCall(peer_id))
    }

    pub fn decline_call(&self, peer_id: PeerId) -> Result<()> {
        self.send(Command::DeclineCall(peer_id))
    }

    pub fn share_screen(&self) -> Result<()> {
        self.send(Command::ShareScreen)
    }

    /// Release every connection
    pub fn leave_call(&self) -> Result<()> {
        self.send(Command::LeaveCall)
    }

    pub fn stop_local_media(&self) -> Result<()> {
        self.send(Command::StopLocalMedia)
    }

    /// Stop the event loop after the commands already queued
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Every connection, sorted by peer id
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.registry.snapshot()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.registry.get(peer_id)
    }
}

/// Collaborators of one mesh instance
pub struct MeshDeps {
    pub local_id: PeerId,
    pub room_id: String,
    pub config: MeshConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub ice: Arc<dyn IceConfigProvider>,
    pub media: Arc<dyn MediaSourceProvider>,
    pub transports: Arc<dyn TransportFactory>,
}

/// At most one invitation per caller per window; remembers accepted callers
#[derive(Debug)]
struct InviteGate {
    window: Duration,
    last_prompt: HashMap<PeerId, Instant>,
    accepted: HashSet<PeerId>,
}

impl InviteGate {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_prompt: HashMap::new(),
            accepted: HashSet::new(),
        }
    }

    /// Whether a prompt for `peer_id` should be shown now
    fn should_prompt(&mut self, peer_id: &PeerId) -> bool {
        let now = Instant::now();
        match self.last_prompt.get(peer_id) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_prompt.insert(peer_id.clone(), now);
                true
            }
        }
    }

    fn forget(&mut self, peer_id: &PeerId) {
        self.last_prompt.remove(peer_id);
        self.accepted.remove(peer_id);
    }

    fn clear(&mut self) {
        self.last_prompt.clear();
        self.accepted.clear();
    }
}

/// Participants still to be called after joining, one per stagger tick
#[derive(Debug, Default)]
struct Stagger {
    queue: VecDeque<PeerId>,
    timer: Option<AbortHandle>,
}

impl Stagger {
    fn remove(&mut self, peer_id: &PeerId) {
        self.queue.retain(|p| p != peer_id);
    }

    fn clear(&mut self) {
        self.queue.clear();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inbox {
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Event loop owning one room's mesh
pub struct RoomCallCoordinator {
    ctx: Arc<MeshContext>,
    negotiator: Negotiator,
    health: HealthSupervisor,
    invites: InviteGate,
    stagger: Stagger,
    inbox: Option<Inbox>,
}

impl RoomCallCoordinator {
    /// Build a coordinator, its handle and the UI event stream
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(
        deps: MeshDeps,
    ) -> Result<(Self, MeshHandle, mpsc::UnboundedReceiver<CallEvent>)> {
        deps.config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ConnectionRegistry::new(events_tx.clone()));
        let invite_window = deps.config.health.invite_window();
        let ctx = Arc::new(MeshContext {
            local_id: deps.local_id,
            room_id: deps.room_id,
            codecs: CodecPreferences::for_device(deps.config.prefer_vp9),
            config: deps.config,
            registry: Arc::clone(&registry),
            roster: Roster::default(),
            tracks: TrackRouter::new(call_tx.clone()),
            signaling: deps.signaling,
            ice: deps.ice,
            media: deps.media,
            transports: deps.transports,
            events: events_tx,
            call_events: call_tx,
        });

        let negotiator = Negotiator::new(Arc::clone(&ctx));
        let health = HealthSupervisor::new(Arc::clone(&ctx), negotiator.clone());
        let coordinator = Self {
            ctx,
            negotiator,
            health,
            invites: InviteGate::new(invite_window),
            stagger: Stagger::default(),
            inbox: Some(Inbox {
                events: events_rx,
                commands: commands_rx,
            }),
        };
        let handle = MeshHandle {
            commands: commands_tx,
            registry,
        };
        Ok((coordinator, handle, call_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.ctx.local_id
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.ctx.registry.get(peer_id)
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.ctx.registry.snapshot()
    }

    /// Participants known to be in the call, sorted
    pub fn roster(&self) -> Vec<PeerId> {
        self.ctx.roster.members()
    }

    pub fn stream(&self, peer_id: &PeerId, kind: StreamKind) -> Option<RoutedStream> {
        self.ctx.tracks.stream(peer_id, kind)
    }

    pub fn has_pending_recreation(&self, peer_id: &PeerId) -> bool {
        self.ctx.registry.has_pending_recreation(peer_id)
    }

    /// Run until shut down or until the signaling channel closes
    pub async fn run(
        mut self,
        mut signaling: mpsc::UnboundedReceiver<SignalMessage>,
    ) -> Result<()> {
        let mut inbox = self
            .inbox
            .take()
            .ok_or_else(|| Error::InternalError("Coordinator is already running".to_string()))?;

        let period = self.ctx.config.health.sweep_interval();
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Mesh for {} running in room {}",
            self.ctx.local_id, self.ctx.room_id
        );

        loop {
            tokio::select! {
                message = signaling.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        warn!("Signaling channel closed");
                        break;
                    }
                },
                Some(event) = inbox.events.recv() => self.handle_event(event).await,
                command = inbox.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command.clone()).await {
                            warn!("{:?} failed: {}", command, e);
                        }
                    }
                },
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.release_all();
        info!("Mesh for {} stopped", self.ctx.local_id);
        Ok(())
    }

    /// Handle internal events that are already queued
    ///
    /// Returns how many were handled. Used to drive a coordinator that is not
    /// running its own loop.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let next = match self.inbox.as_mut() {
                Some(inbox) => inbox.events.try_recv().ok(),
                None => None,
            };
            let Some(event) = next else {
                break;
            };
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::StartCall => self.start_call().await,
            Command::AcceptCall(peer_id) => self.accept_call(&peer_id).await,
            Command::DeclineCall(peer_id) => {
                self.decline_call(&peer_id);
                Ok(())
            }
            Command::ShareScreen => self.share_screen().await,
            Command::LeaveCall => {
                self.leave_call();
                Ok(())
            }
            Command::StopLocalMedia => {
                self.ctx.media.stop_local();
                Ok(())
            }
            Command::Shutdown => {
                self.release_all();
                Ok(())
            }
        }
    }

    /// Handle one message from the relay
    pub async fn handle_signal(&mut self, message: SignalMessage) {
        if message.sender() == Some(&self.ctx.local_id) {
            debug!("Ignoring own {}", message.name());
            return;
        }
        if message.recipient().is_some_and(|to| *to != self.ctx.local_id) {
            debug!("Ignoring {} addressed to someone else", message.name());
            return;
        }

        let name = message.name();
        debug!("Received {} from {:?}", name, message.sender());
        if let Err(e) = self.dispatch_signal(message).await {
            warn!("Failed to handle {}: {}", name, e);
        }
    }

    async fn dispatch_signal(&mut self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Offer {
                offer,
                from,
                is_restart,
                ..
            } => {
                let peer_id = require_sender(from, "webrtc-offer")?;
                self.ctx.roster.insert(peer_id.clone());
                let options = OpenOptions {
                    recreated: false,
                    user_accepted: self.invites.accepted.contains(&peer_id),
                };
                self.negotiator
                    .handle_offer(&peer_id, offer, is_restart, options)
                    .await
            }
            SignalMessage::Answer { answer, from, .. } => {
                let peer_id = require_sender(from, "webrtc-answer")?;
                self.negotiator.handle_answer(&peer_id, answer).await
            }
            SignalMessage::IceCandidate {
                candidate, from, ..
            } => {
                let peer_id = require_sender(from, "ice-candidate")?;
                self.negotiator
                    .handle_ice_candidate(&peer_id, candidate)
                    .await;
                Ok(())
            }
            SignalMessage::UserReadyForCall {
                user_id, user_name, ..
            } => {
                let peer_id = require_sender(user_id, "userReadyForCall")?;
                self.on_user_ready(peer_id, user_name).await
            }
            SignalMessage::UserReadyForScreenShare { user_id, .. } => {
                let peer_id = require_sender(user_id, "userReadyForScreenShare")?;
                self.ctx.roster.insert(peer_id.clone());
                if self.ctx.registry.contains(&peer_id) {
                    return Ok(());
                }
                info!("Peer {} is sharing its screen; connecting", peer_id);
                self.negotiator
                    .open(&peer_id, Role::Initiator, OpenOptions::default())
                    .await
                    .map(|_| ())
            }
            SignalMessage::ExistingCallParticipants { participants } => {
                self.on_existing_participants(participants).await;
                Ok(())
            }
            SignalMessage::UserLeftCall { user_id, .. } => {
                info!("Peer {} left the call", user_id);
                self.ctx.roster.remove(&user_id);
                self.invites.forget(&user_id);
                self.stagger.remove(&user_id);
                self.ctx.release_peer(&user_id);
                Ok(())
            }
            SignalMessage::WebrtcError {
                kind,
                message,
                to_user,
            } => {
                match to_user {
                    Some(peer_id) => {
                        warn!(
                            "Relay reported {} for peer {}: {}; releasing connection",
                            kind, peer_id, message
                        );
                        self.ctx.release_peer(&peer_id);
                    }
                    None => info!("Relay reported {}: {}", kind, message),
                }
                Ok(())
            }
        }
    }

    /// A participant has media and is ready; call it or ask the user
    async fn on_user_ready(&mut self, peer_id: PeerId, user_name: Option<String>) -> Result<()> {
        self.ctx.roster.insert(peer_id.clone());

        if !self.ctx.media.local_tracks().is_empty() {
            if let Some(existing) = self.ctx.registry.get(&peer_id) {
                if !matches!(
                    existing.connection_state,
                    ConnectionState::Failed | ConnectionState::Closed
                ) {
                    debug!(
                        "Peer {} re-announced while {:?}; keeping existing connection",
                        peer_id, existing.connection_state
                    );
                    return Ok(());
                }
            }
            info!("Peer {} is ready; calling", peer_id);
            self.negotiator
                .open(&peer_id, Role::Initiator, OpenOptions::default())
                .await?;
            return Ok(());
        }

        if self.invites.should_prompt(&peer_id) {
            info!("Incoming call from peer {}", peer_id);
            self.ctx.emit(CallEvent::IncomingCall { peer_id, user_name });
        } else {
            debug!("Suppressed repeated invitation from peer {}", peer_id);
        }
        Ok(())
    }

    /// Call participants already present, one per stagger interval
    async fn on_existing_participants(&mut self, participants: Vec<Participant>) {
        for participant in participants {
            let peer_id = participant.user_id;
            if peer_id == self.ctx.local_id {
                continue;
            }
            self.ctx.roster.insert(peer_id.clone());
            if !self.ctx.registry.contains(&peer_id) && !self.stagger.queue.contains(&peer_id) {
                self.stagger.queue.push_back(peer_id);
            }
        }
        info!(
            "{} existing participant(s) to call",
            self.stagger.queue.len()
        );
        if self.stagger.timer.is_none() {
            self.open_next_participant().await;
        }
    }

    async fn open_next_participant(&mut self) {
        self.stagger.timer = None;
        while let Some(peer_id) = self.stagger.queue.pop_front() {
            if self.ctx.registry.contains(&peer_id) || !self.ctx.roster.contains(&peer_id) {
                continue;
            }
            if let Err(e) = self
                .negotiator
                .open(&peer_id, Role::Initiator, OpenOptions::default())
                .await
            {
                warn!("Failed to call participant {}: {}", peer_id, e);
            }
            break;
        }
        if !self.stagger.queue.is_empty() {
            self.stagger.timer = Some(spawn_delayed(
                self.ctx.config.health.participant_stagger(),
                &self.ctx.events,
                MeshEvent::StaggerTick,
            ));
        }
    }

    async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Transport {
                peer_id,
                connection_id,
                event,
            } => {
                if !self.ctx.registry.is_current(&peer_id, connection_id) {
                    debug!(
                        "Dropping {:?} from replaced connection {} of peer {}",
                        event, connection_id, peer_id
                    );
                    return;
                }
                let result = match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        self.negotiator
                            .on_local_candidate(&peer_id, connection_id, candidate)
                            .await
                    }
                    TransportEvent::GatheringComplete => {
                        self.health.on_gathering_complete(&peer_id, connection_id);
                        Ok(())
                    }
                    TransportEvent::ConnectionState(state) => {
                        self.health
                            .on_connection_state(&peer_id, connection_id, state);
                        Ok(())
                    }
                    TransportEvent::IceConnectionState(state) => {
                        self.health.on_ice_state(&peer_id, connection_id, state);
                        Ok(())
                    }
                    TransportEvent::SignalingState(state) => {
                        self.negotiator
                            .on_signaling_state(&peer_id, connection_id, state);
                        Ok(())
                    }
                    TransportEvent::Track(track) => {
                        self.ctx.tracks.route(&peer_id, track);
                        Ok(())
                    }
                    TransportEvent::NegotiationNeeded => {
                        self.negotiator
                            .on_negotiation_needed(&peer_id, connection_id)
                            .await
                    }
                };
                if let Err(e) = result {
                    warn!("Transport event for peer {} failed: {}", peer_id, e);
                }
            }
            MeshEvent::Timer {
                peer_id,
                connection_id,
                kind,
            } => self.health.on_timer(&peer_id, connection_id, kind).await,
            MeshEvent::Recreate { peer_id } => self.health.on_recreate(&peer_id).await,
            MeshEvent::StaggerTick => self.open_next_participant().await,
        }
    }

    /// Run the periodic health sweep now; returns how many connections were recreated
    pub async fn sweep(&mut self) -> usize {
        self.health.sweep().await
    }

    /// Acquire media and tell the room we are ready to be called
    pub async fn start_call(&mut self) -> Result<()> {
        self.ensure_media().await?;
        self.announce_ready().await
    }

    /// Accept an invitation; the caller connects to us once we announce
    pub async fn accept_call(&mut self, peer_id: &PeerId) -> Result<()> {
        info!("Accepting call from peer {}", peer_id);
        self.invites.accepted.insert(peer_id.clone());
        self.ensure_media().await?;
        self.announce_ready().await
    }

    pub fn decline_call(&mut self, peer_id: &PeerId) {
        info!("Declined call from peer {}", peer_id);
        self.invites.accepted.remove(peer_id);
    }

    /// Start screen capture and send it to every connected peer
    pub async fn share_screen(&mut self) -> Result<()> {
        let screen = match self.ctx.media.acquire_screen().await {
            Ok(screen) => screen,
            Err(e) => {
                self.ctx.notify(Notice::MediaUnavailable(e.clone()));
                return Err(e.into());
            }
        };

        self.ctx
            .send(SignalMessage::UserReadyForScreenShare {
                room_id: self.ctx.room_id.clone(),
                user_id: None,
                user_name: None,
            })
            .await?;

        for peer_id in self.ctx.registry.peer_ids() {
            if let Err(e) = self.negotiator.attach_screen(&peer_id, &screen).await {
                warn!("Failed to share screen with peer {}: {}", peer_id, e);
            }
        }
        Ok(())
    }

    /// Release every connection and forget the call
    pub fn leave_call(&mut self) {
        info!("Leaving call with {} connection(s)", self.ctx.registry.len());
        self.release_all();
    }

    async fn ensure_media(&self) -> Result<()> {
        if !self.ctx.media.local_tracks().is_empty() {
            return Ok(());
        }
        match self.ctx.media.acquire(MediaConstraints::default()).await {
            Ok(tracks) => {
                debug!("Local media ready with {} track(s)", tracks.len());
                Ok(())
            }
            Err(e) => {
                self.ctx.notify(Notice::MediaUnavailable(e.clone()));
                Err(e.into())
            }
        }
    }

    async fn announce_ready(&self) -> Result<()> {
        self.ctx
            .send(SignalMessage::UserReadyForCall {
                room_id: self.ctx.room_id.clone(),
                user_id: None,
                user_name: None,
            })
            .await
    }

    fn release_all(&mut self) {
        self.stagger.clear();
        self.invites.clear();
        self.ctx.roster.clear();
        for peer_id in self.ctx.registry.peer_ids() {
            self.ctx.tracks.release(&peer_id);
        }
        self.ctx.registry.clear();
        self.ctx.after_removal();
    }
}

fn require_sender(sender: Option<PeerId>, event: &str) -> Result<PeerId> {
    sender.ok_or_else(|| Error::SignalingError(format!("{} without sender", event)))
}
