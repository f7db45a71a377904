//! Peer connection mesh for collaborative code rooms
//!
//! Every participant keeps one direct WebRTC connection to every other
//! participant in the room's call. Connection setup is brokered by the room's
//! signaling relay; media flows peer to peer.
//!
//! # Features
//!
//! - **Full mesh**: one connection per remote participant, created and torn
//!   down as participants join and leave the call
//! - **Deterministic glare resolution**: simultaneous offers converge with a
//!   single rollback
//! - **Self-healing**: debounced renegotiation, bounded ICE restarts and at
//!   most one full recreation per failure
//! - **Candidate buffering**: early ICE candidates are replayed in order once
//!   the remote description is applied
//! - **Track routing**: remote camera and screen media are grouped per peer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Signaling relay (WebSocket)        Application / UI     │
//! │        ↓ SignalMessage                ↓ MeshHandle       │
//! │  RoomCallCoordinator (single event loop)                 │
//! │  ├─ Negotiator        offer/answer, glare, candidates    │
//! │  ├─ HealthSupervisor  repair table, timers, sweep        │
//! │  ├─ TrackRouter       remote tracks → CallEvent          │
//! │  └─ ConnectionRegistry  one PeerConnection per peer      │
//! │        ↓ PeerTransport                                   │
//! │  webrtc-rs RTCPeerConnection                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use coderoom_mesh::MeshConfig;
//!
//! let config = MeshConfig::default().with_prefer_vp9(true);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.health.max_reconnect_attempts, 3);
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod health;
pub mod ice;
pub mod media;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod tracks;
pub mod transport;

mod context;
mod negotiator;

pub use config::{HealthOptions, MeshConfig, TurnServerConfig};
pub use coordinator::{CallEvent, Command, MeshDeps, MeshHandle, Notice, RoomCallCoordinator};
pub use error::{Error, MediaError, Result};
pub use ice::{IceConfigProvider, IceServer, StaticIceConfig};
pub use media::{LocalMedia, LocalTrack, MediaSourceProvider, TrackSet};
pub use peer::{ConnectionState, PeerId, PeerInfo, Role, SignalingState};
pub use signaling::{SignalMessage, SignalingChannel, WebSocketSignaling};
pub use tracks::{RoutedStream, StreamKind};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
