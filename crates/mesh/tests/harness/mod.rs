//! Mesh Integration Test Harness
//!
//! Runs real coordinators against in-memory collaborators:
//! - [`MockTransport`]: offer/answer state machine, driven by the test
//! - [`RecordingSignaling`]: collects outbound envelopes
//! - [`FailingMedia`] / [`call_media`]: local media sources
//!
//! Nodes never run their own loop. A test moves envelopes between nodes with
//! [`deliver`] or [`exchange`], injects transport events with
//! [`TestNode::emit`], and advances paused time with `tokio::time::sleep`
//! before calling [`TestNode::settle`] to handle whatever fired.

#![allow(dead_code)]

pub mod media;
pub mod mock_transport;
pub mod signaling;

use coderoom_mesh::transport::TransportEvent;
use coderoom_mesh::{
    CallEvent, ConnectionState, MeshConfig, MeshDeps, MeshHandle, MediaSourceProvider, Notice,
    PeerId, PeerInfo, RoomCallCoordinator, SignalMessage, StaticIceConfig,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use media::{call_media, media_with_broken_camera, FailingMedia};
pub use mock_transport::{MockTransport, MockTransportFactory, MOCK_SDP};
pub use signaling::{stamp, RecordingSignaling};

pub const ROOM: &str = "room-1";

/// Initialize test logging (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

/// One participant: a coordinator and its in-memory collaborators
pub struct TestNode {
    pub id: PeerId,
    pub coordinator: RoomCallCoordinator,
    pub handle: MeshHandle,
    pub call_events: mpsc::UnboundedReceiver<CallEvent>,
    pub signaling: Arc<RecordingSignaling>,
    pub transports: Arc<MockTransportFactory>,
    pub media: Arc<dyn MediaSourceProvider>,
}

pub struct TestNodeBuilder {
    id: PeerId,
    config: MeshConfig,
    media: Arc<dyn MediaSourceProvider>,
}

impl TestNodeBuilder {
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSourceProvider>) -> Self {
        self.media = media;
        self
    }

    /// Camera and microphone already running
    pub fn with_call_media(self) -> Self {
        self.with_media(Arc::new(call_media()))
    }

    pub fn build(self) -> TestNode {
        let signaling = Arc::new(RecordingSignaling::default());
        let transports = Arc::new(MockTransportFactory::default());
        let deps = MeshDeps {
            local_id: self.id.clone(),
            room_id: ROOM.to_string(),
            ice: Arc::new(StaticIceConfig::from_config(&self.config)),
            config: self.config,
            signaling: signaling.clone(),
            media: Arc::clone(&self.media),
            transports: transports.clone(),
        };
        let (coordinator, handle, call_events) =
            RoomCallCoordinator::new(deps).expect("valid test config");

        TestNode {
            id: self.id,
            coordinator,
            handle,
            call_events,
            signaling,
            transports,
            media: self.media,
        }
    }
}

impl TestNode {
    /// Node without local media
    pub fn builder(id: &str) -> TestNodeBuilder {
        TestNodeBuilder {
            id: PeerId::from(id),
            config: MeshConfig::default(),
            media: Arc::new(coderoom_mesh::LocalMedia::new()),
        }
    }

    pub fn new(id: &str) -> Self {
        Self::builder(id).build()
    }

    /// Node with camera and microphone already running
    pub fn with_media(id: &str) -> Self {
        Self::builder(id).with_call_media().build()
    }

    /// Current transport towards `peer`
    pub fn transport(&self, peer: &str) -> Arc<MockTransport> {
        self.transports
            .latest(&PeerId::from(peer))
            .unwrap_or_else(|| panic!("{} has no transport for {}", self.id, peer))
    }

    pub fn peer(&self, peer: &str) -> Option<PeerInfo> {
        self.coordinator.peer(&PeerId::from(peer))
    }

    pub fn created_for(&self, peer: &str) -> usize {
        self.transports.created_for(&PeerId::from(peer))
    }

    /// Handle queued internal events until none are left
    pub async fn settle(&mut self) -> usize {
        let mut handled = 0;
        loop {
            tokio::task::yield_now().await;
            let n = self.coordinator.process_pending().await;
            if n == 0 {
                return handled;
            }
            handled += n;
        }
    }

    /// Report a transport event for the connection to `peer` and handle it
    pub async fn emit(&mut self, peer: &str, event: TransportEvent) {
        self.transport(peer).emit(event);
        self.settle().await;
    }

    pub async fn set_state(&mut self, peer: &str, state: ConnectionState) {
        self.emit(peer, TransportEvent::ConnectionState(state)).await;
    }

    /// Hand envelopes to this node as if the relay forwarded them from `from`
    pub async fn receive(&mut self, from: &PeerId, messages: Vec<SignalMessage>) -> usize {
        let count = messages.len();
        for message in messages {
            self.coordinator.handle_signal(stamp(message, from)).await;
            self.settle().await;
        }
        count
    }

    /// Take everything this node sent
    pub fn outbox(&self) -> Vec<SignalMessage> {
        self.signaling.take()
    }

    /// Drain the UI event stream
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.call_events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::Notice(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }
}

/// Forward everything `from` sent to `to`; returns how many envelopes moved
pub async fn deliver(from: &mut TestNode, to: &mut TestNode) -> usize {
    let messages = from.signaling.take();
    let sender = from.id.clone();
    to.receive(&sender, messages).await
}

/// Relay between two nodes until both are quiet
pub async fn exchange(a: &mut TestNode, b: &mut TestNode) {
    loop {
        let moved = deliver(a, b).await + deliver(b, a).await;
        if moved == 0 {
            return;
        }
    }
}

/// `a` starts a call that `b` (with media running) picks up, then both
/// transports report connected
///
/// `b` ends up as the initiator and `a` as the responder.
pub async fn connect_pair(a: &mut TestNode, b: &mut TestNode) {
    a.coordinator.start_call().await.expect("start call");
    exchange(a, b).await;

    let (a_id, b_id) = (a.id.to_string(), b.id.to_string());
    a.set_state(&b_id, ConnectionState::Connected).await;
    b.set_state(&a_id, ConnectionState::Connected).await;
}

/// Names of the envelopes in `messages`, in order
pub fn names(messages: &[SignalMessage]) -> Vec<&'static str> {
    messages.iter().map(|m| m.name()).collect()
}
