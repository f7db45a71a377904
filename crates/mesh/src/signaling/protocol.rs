//! Signaling envelopes exchanged through the room relay
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. The relay
//! stamps `from` on messages it forwards and routes on `to`; the mesh leaves
//! `from` empty on everything it sends. File sync, chat and whiteboard use
//! the same channel with their own event names, which [`SignalMessage::decode`]
//! reports as not ours instead of as errors.

use crate::peer::PeerId;
use crate::transport::{IceCandidate, SessionDescription};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Event names handled by the mesh
pub const MESH_EVENTS: &[&str] = &[
    "webrtc-offer",
    "webrtc-answer",
    "ice-candidate",
    "userReadyForCall",
    "userReadyForScreenShare",
    "existingCallParticipants",
    "userLeftCall",
    "webrtcError",
];

/// A participant already in the call when we join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: PeerId,
    #[serde(default)]
    pub user_name: String,
}

/// One signaling envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalMessage {
    #[serde(rename = "webrtc-offer", rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default)]
        room_id: String,
        #[serde(default)]
        is_restart: bool,
    },

    #[serde(rename = "webrtc-answer", rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default)]
        room_id: String,
    },

    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default)]
        room_id: String,
    },

    /// A participant has media and is ready to be called
    #[serde(rename = "userReadyForCall", rename_all = "camelCase")]
    UserReadyForCall {
        #[serde(default)]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    /// A participant is about to send screen-capture media
    #[serde(rename = "userReadyForScreenShare", rename_all = "camelCase")]
    UserReadyForScreenShare {
        #[serde(default)]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    #[serde(rename = "existingCallParticipants", rename_all = "camelCase")]
    ExistingCallParticipants { participants: Vec<Participant> },

    #[serde(rename = "userLeftCall", rename_all = "camelCase")]
    UserLeftCall {
        user_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    /// Relay-side failure, optionally naming the participant it concerns
    #[serde(rename = "webrtcError", rename_all = "camelCase")]
    WebrtcError {
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_user: Option<PeerId>,
    },
}

impl SignalMessage {
    /// Event name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "webrtc-offer",
            SignalMessage::Answer { .. } => "webrtc-answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::UserReadyForCall { .. } => "userReadyForCall",
            SignalMessage::UserReadyForScreenShare { .. } => "userReadyForScreenShare",
            SignalMessage::ExistingCallParticipants { .. } => "existingCallParticipants",
            SignalMessage::UserLeftCall { .. } => "userLeftCall",
            SignalMessage::WebrtcError { .. } => "webrtcError",
        }
    }

    /// Participant the relay says sent this message
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => from.as_ref(),
            SignalMessage::UserReadyForCall { user_id, .. }
            | SignalMessage::UserReadyForScreenShare { user_id, .. } => user_id.as_ref(),
            SignalMessage::UserLeftCall { user_id, .. } => Some(user_id),
            SignalMessage::ExistingCallParticipants { .. } | SignalMessage::WebrtcError { .. } => {
                None
            }
        }
    }

    /// Participant this message is addressed to, if any
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => to.as_ref(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to encode {}: {}", self.name(), e))
        })
    }

    /// Decode a frame from the relay
    ///
    /// Returns `Ok(None)` for well-formed frames carrying another feature's
    /// event, and an error for malformed frames or malformed mesh events.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("Invalid signaling frame: {}", e)))?;

        let event = value
            .get("event")
            .and_then(|e| e.as_str())
            .ok_or_else(|| {
                Error::SerializationError("Signaling frame has no event name".to_string())
            })?;

        if !MESH_EVENTS.contains(&event) {
            return Ok(None);
        }

        let event = event.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::SerializationError(format!("Invalid {} message: {}", event, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let message = SignalMessage::Offer {
            offer: SessionDescription::offer("v=0"),
            from: None,
            to: Some(PeerId::from("2")),
            room_id: "room-1".to_string(),
            is_restart: true,
        };

        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "webrtc-offer",
                "data": {
                    "offer": { "type": "offer", "sdp": "v=0" },
                    "to": "2",
                    "roomId": "room-1",
                    "isRestart": true
                }
            })
        );
    }

    #[test]
    fn test_decode_relayed_answer() {
        let text = json!({
            "event": "webrtc-answer",
            "data": {
                "answer": { "type": "answer", "sdp": "v=0" },
                "from": "7",
                "to": "3",
                "roomId": "room-1"
            }
        })
        .to_string();

        let message = SignalMessage::decode(&text).unwrap().unwrap();
        assert_eq!(message.name(), "webrtc-answer");
        assert_eq!(message.sender(), Some(&PeerId::from("7")));
        assert_eq!(message.recipient(), Some(&PeerId::from("3")));
    }

    #[test]
    fn test_decode_offer_defaults_restart_flag() {
        let text = json!({
            "event": "webrtc-offer",
            "data": { "offer": { "type": "offer", "sdp": "v=0" }, "from": "a" }
        })
        .to_string();

        match SignalMessage::decode(&text).unwrap().unwrap() {
            SignalMessage::Offer {
                is_restart,
                room_id,
                ..
            } => {
                assert!(!is_restart);
                assert!(room_id.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_candidate() {
        let text = json!({
            "event": "ice-candidate",
            "data": {
                "candidate": {
                    "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ relay",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                },
                "from": "b"
            }
        })
        .to_string();

        match SignalMessage::decode(&text).unwrap().unwrap() {
            SignalMessage::IceCandidate { candidate, .. } => assert!(candidate.is_relay()),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_webrtc_error_type_field() {
        let text = json!({
            "event": "webrtcError",
            "data": { "type": "offer-failed", "message": "peer gone", "toUser": "9" }
        })
        .to_string();

        let message = SignalMessage::decode(&text).unwrap().unwrap();
        assert_eq!(
            message,
            SignalMessage::WebrtcError {
                kind: "offer-failed".to_string(),
                message: "peer gone".to_string(),
                to_user: Some(PeerId::from("9")),
            }
        );
    }

    #[test]
    fn test_existing_participants() {
        let text = json!({
            "event": "existingCallParticipants",
            "data": { "participants": [
                { "userId": "1", "userName": "Ada" },
                { "userId": "2", "userName": "Lin" }
            ] }
        })
        .to_string();

        match SignalMessage::decode(&text).unwrap().unwrap() {
            SignalMessage::ExistingCallParticipants { participants } => {
                let ids: Vec<&str> = participants.iter().map(|p| p.user_id.as_str()).collect();
                assert_eq!(ids, vec!["1", "2"]);
                assert_eq!(participants[0].user_name, "Ada");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_foreign_events_are_not_ours() {
        let text = json!({ "event": "file-update", "data": { "path": "main.rs" } }).to_string();
        assert!(SignalMessage::decode(&text).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(SignalMessage::decode("not json").is_err());
        assert!(SignalMessage::decode(r#"{"data": {}}"#).is_err());
        assert!(SignalMessage::decode(r#"{"event": "userLeftCall", "data": {}}"#).is_err());
    }
}
