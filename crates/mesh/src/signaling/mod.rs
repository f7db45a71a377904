//! Signaling channel to the room relay
//!
//! The mesh only sends envelopes through a [`SignalingChannel`]; inbound
//! envelopes are handed to the coordinator by whoever owns the connection.
//! Reconnecting the channel is the owner's concern, not the mesh's.

pub mod protocol;
pub mod websocket;

pub use protocol::{Participant, SignalMessage};
pub use websocket::WebSocketSignaling;

use crate::Result;
use async_trait::async_trait;

/// Outbound half of the room relay connection
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one envelope to the relay
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SignalingError`] if the channel is closed.
    async fn send(&self, message: SignalMessage) -> Result<()>;
}
