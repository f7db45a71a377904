//! Error types for the peer connection mesh

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found in the registry
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Operation not allowed in the transport's current signaling state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Local media could not be acquired
    #[error(transparent)]
    Media(#[from] MediaError),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if the transport rejected the call because of its signaling state
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }
}

/// Reasons local media acquisition can fail
///
/// Acquisition failures are fatal to starting a call and are never retried;
/// each cause carries its own user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    /// The user or the platform refused access to the device
    #[error("media permission denied")]
    PermissionDenied,

    /// The device is held by another application
    #[error("media device busy")]
    DeviceBusy,

    /// No device satisfies the requested constraints
    #[error("unsupported media constraints: {0}")]
    UnsupportedConstraints(String),

    /// Any other acquisition failure
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

impl MediaError {
    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            MediaError::PermissionDenied => {
                "Camera/microphone access was denied. Allow access and try again.".to_string()
            }
            MediaError::DeviceBusy => {
                "Camera or microphone is in use by another application.".to_string()
            }
            MediaError::UnsupportedConstraints(what) => {
                format!("No camera or microphone supports the requested settings ({what}).")
            }
            MediaError::Unavailable(reason) => format!("Could not start media: {reason}"),
        }
    }
}
