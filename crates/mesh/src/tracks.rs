//! Inbound track routing
//!
//! Remote tracks are grouped per peer into a camera stream (camera video and
//! microphone audio) and a screen stream. A track belongs to the screen stream
//! when its label or stream id mentions a screen-capture source. Each stream
//! keeps one audio and one video slot; a track only ever replaces the slot of
//! its own kind, so audio that arrives after video is merged in.

use crate::coordinator::CallEvent;
use crate::media::TrackKind;
use crate::peer::PeerId;
use crate::transport::RemoteTrack;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Substrings that mark a track as screen capture (case-insensitive)
pub const SCREEN_MARKERS: &[&str] = &["screen", "monitor", "window", "display"];

/// Which UI sink a remote stream goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Camera,
    Screen,
}

pub fn classify(track: &RemoteTrack) -> StreamKind {
    let label = track.label.to_lowercase();
    let stream_id = track.stream_id.to_lowercase();
    let is_screen = SCREEN_MARKERS
        .iter()
        .any(|marker| label.contains(marker) || stream_id.contains(marker));
    if is_screen {
        StreamKind::Screen
    } else {
        StreamKind::Camera
    }
}

/// Media published to the UI for one peer and stream kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedStream {
    pub peer_id: PeerId,
    pub kind: StreamKind,
    pub stream_id: String,
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RoutedStream {
    fn new(peer_id: PeerId, kind: StreamKind, stream_id: String) -> Self {
        Self {
            peer_id,
            kind,
            stream_id,
            audio: None,
            video: None,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Routes remote tracks into per-peer streams and publishes them
pub struct TrackRouter {
    streams: Mutex<HashMap<(PeerId, StreamKind), RoutedStream>>,
    sink: mpsc::UnboundedSender<CallEvent>,
}

impl TrackRouter {
    pub fn new(sink: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Merge a track into its stream and publish the updated stream
    pub fn route(&self, peer_id: &PeerId, track: RemoteTrack) -> RoutedStream {
        let kind = classify(&track);
        debug!(
            "Routing {:?} track {} from peer {} to {:?} stream",
            track.kind, track.id, peer_id, kind
        );

        let routed = {
            let mut streams = self.streams.lock();
            let stream = streams
                .entry((peer_id.clone(), kind))
                .or_insert_with(|| RoutedStream::new(peer_id.clone(), kind, track.stream_id.clone()));
            stream.stream_id = track.stream_id.clone();
            match track.kind {
                TrackKind::Audio => stream.audio = Some(track),
                TrackKind::Video => stream.video = Some(track),
            }
            stream.clone()
        };

        let _ = self.sink.send(CallEvent::StreamUpdated(routed.clone()));
        routed
    }

    pub fn stream(&self, peer_id: &PeerId, kind: StreamKind) -> Option<RoutedStream> {
        self.streams.lock().get(&(peer_id.clone(), kind)).cloned()
    }

    /// Drop every stream of a peer and tell the UI; returns how many were removed
    pub fn release(&self, peer_id: &PeerId) -> usize {
        let mut removed = Vec::new();
        self.streams.lock().retain(|(peer, kind), _| {
            if peer == peer_id {
                removed.push(*kind);
                false
            } else {
                true
            }
        });

        for kind in &removed {
            let _ = self.sink.send(CallEvent::StreamRemoved {
                peer_id: peer_id.clone(),
                kind: *kind,
            });
        }
        if !removed.is_empty() {
            info!("Released {} stream(s) from peer {}", removed.len(), peer_id);
        }
        removed.len()
    }
}
