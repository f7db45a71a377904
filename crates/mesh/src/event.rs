//! Internal events of the mesh event loop
//!
//! Transport callbacks and timers never touch mesh state directly; they post
//! a [`MeshEvent`] and the coordinator handles it on its own turn. Every
//! per-connection event carries the [`ConnectionId`] it was produced for, so
//! events from a replaced transport are recognised and dropped.

use crate::peer::{ConnectionId, PeerId, TimerKind};
use crate::transport::TransportEvent;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Something happened on a peer's transport
    Transport {
        peer_id: PeerId,
        connection_id: ConnectionId,
        event: TransportEvent,
    },
    /// A peer-scoped timer fired
    Timer {
        peer_id: PeerId,
        connection_id: ConnectionId,
        kind: TimerKind,
    },
    /// A scheduled full recreation is due
    Recreate { peer_id: PeerId },
    /// Time to open the next staggered participant connection
    StaggerTick,
}

pub type EventSender = mpsc::UnboundedSender<MeshEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MeshEvent>;
