//! Recording signaling channel and relay stamping

use async_trait::async_trait;
use coderoom_mesh::{PeerId, Result, SignalMessage, SignalingChannel};
use parking_lot::Mutex;

/// Keeps every envelope the mesh sends until a test takes it
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalMessage>>,
}

impl RecordingSignaling {
    /// Take everything sent so far
    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Everything sent so far, without taking it
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Fill in the sender the way the relay does before forwarding
pub fn stamp(message: SignalMessage, sender: &PeerId) -> SignalMessage {
    let from = Some(sender.clone());
    match message {
        SignalMessage::Offer {
            offer,
            to,
            room_id,
            is_restart,
            ..
        } => SignalMessage::Offer {
            offer,
            from,
            to,
            room_id,
            is_restart,
        },
        SignalMessage::Answer {
            answer,
            to,
            room_id,
            ..
        } => SignalMessage::Answer {
            answer,
            from,
            to,
            room_id,
        },
        SignalMessage::IceCandidate {
            candidate,
            to,
            room_id,
            ..
        } => SignalMessage::IceCandidate {
            candidate,
            from,
            to,
            room_id,
        },
        SignalMessage::UserReadyForCall {
            room_id, user_name, ..
        } => SignalMessage::UserReadyForCall {
            room_id,
            user_id: from,
            user_name,
        },
        SignalMessage::UserReadyForScreenShare {
            room_id, user_name, ..
        } => SignalMessage::UserReadyForScreenShare {
            room_id,
            user_id: from,
            user_name,
        },
        other => other,
    }
}
