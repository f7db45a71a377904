//! Local outbound media
//!
//! The mesh does not capture or encode media. It only needs to know which
//! local tracks exist so it can attach them to new connections, and it needs
//! a way to stop them. [`MediaSourceProvider`] is that seam; [`LocalMedia`] is
//! the in-process implementation used by the `mesh-node` binary, where the
//! application feeds samples into the transport's outbound tracks.

use crate::error::MediaError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Handle to one local outbound track
///
/// Clones share the same stopped flag, so stopping any clone stops the track
/// everywhere it is attached. Use [`LocalTrack::fork`] for an independent
/// copy that can be stopped on its own.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    stream_id: String,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            label: label.into(),
            stream_id: stream_id.into(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn microphone(stream_id: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, TrackSource::Microphone, "microphone", stream_id)
    }

    pub fn camera(stream_id: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, TrackSource::Camera, "camera", stream_id)
    }

    pub fn screen(stream_id: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, TrackSource::Screen, "screen", stream_id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_screen(&self) -> bool {
        self.source == TrackSource::Screen
    }

    /// Independent copy with its own id and stopped flag
    pub fn fork(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stopped: Arc::new(AtomicBool::new(false)),
            ..self.clone()
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Ordered set of local tracks
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    tracks: Vec<LocalTrack>,
}

impl TrackSet {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn push(&mut self, track: LocalTrack) {
        self.tracks.push(track);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Tracks that have not been stopped
    pub fn live(&self) -> TrackSet {
        Self::new(self.tracks.iter().filter(|t| !t.is_stopped()).cloned().collect())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl IntoIterator for TrackSet {
    type Item = LocalTrack;
    type IntoIter = std::vec::IntoIter<LocalTrack>;

    fn into_iter(self) -> Self::IntoIter {
        self.tracks.into_iter()
    }
}

/// What to acquire when starting a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Source of local outbound media
#[async_trait]
pub trait MediaSourceProvider: Send + Sync {
    /// Current camera/microphone tracks (empty when no call media is active)
    fn local_tracks(&self) -> TrackSet;

    /// Current screen-capture track, if screen sharing is active
    fn screen_track(&self) -> Option<LocalTrack>;

    /// Acquire camera/microphone tracks
    async fn acquire(&self, constraints: MediaConstraints) -> Result<TrackSet, MediaError>;

    /// Acquire a screen-capture track
    async fn acquire_screen(&self) -> Result<LocalTrack, MediaError>;

    /// Stop and forget the camera/microphone tracks
    fn stop_local(&self);
}

#[derive(Debug, Default)]
struct LocalMediaState {
    tracks: TrackSet,
    screen: Option<LocalTrack>,
}

/// In-process media source
///
/// Acquisition creates track descriptors; the samples themselves are written
/// by the application through the transport layer.
///
/// ```
/// use coderoom_mesh::media::MediaConstraints;
/// use coderoom_mesh::{LocalMedia, MediaSourceProvider};
///
/// # tokio_test::block_on(async {
/// let media = LocalMedia::new();
/// let tracks = media.acquire(MediaConstraints::default()).await.unwrap();
/// assert_eq!(tracks.len(), 2);
///
/// media.stop_local();
/// assert!(media.local_tracks().is_empty());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct LocalMedia {
    state: Mutex<LocalMediaState>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Media source that starts with the given tracks already acquired
    pub fn with_tracks(tracks: TrackSet) -> Self {
        Self {
            state: Mutex::new(LocalMediaState {
                tracks,
                screen: None,
            }),
        }
    }
}

#[async_trait]
impl MediaSourceProvider for LocalMedia {
    fn local_tracks(&self) -> TrackSet {
        self.state.lock().tracks.live()
    }

    fn screen_track(&self) -> Option<LocalTrack> {
        self.state
            .lock()
            .screen
            .as_ref()
            .filter(|t| !t.is_stopped())
            .cloned()
    }

    async fn acquire(&self, constraints: MediaConstraints) -> Result<TrackSet, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::UnsupportedConstraints(
                "neither audio nor video requested".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let live = state.tracks.live();
        if !live.is_empty() {
            return Ok(live);
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = TrackSet::default();
        if constraints.audio {
            tracks.push(LocalTrack::microphone(&stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::camera(&stream_id));
        }
        info!("Acquired {} local track(s) on stream {}", tracks.len(), stream_id);
        state.tracks = tracks.clone();
        Ok(tracks)
    }

    async fn acquire_screen(&self) -> Result<LocalTrack, MediaError> {
        let mut state = self.state.lock();
        if let Some(screen) = state.screen.as_ref().filter(|t| !t.is_stopped()) {
            return Ok(screen.clone());
        }
        let track = LocalTrack::screen(format!("screen-{}", uuid::Uuid::new_v4()));
        info!("Acquired screen capture track {}", track.id());
        state.screen = Some(track.clone());
        Ok(track)
    }

    fn stop_local(&self) {
        let mut state = self.state.lock();
        if !state.tracks.is_empty() {
            info!("Stopping {} local track(s)", state.tracks.len());
        }
        state.tracks.stop_all();
        state.tracks = TrackSet::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_clone_shares_stop_flag() {
        let track = LocalTrack::camera("stream");
        let clone = track.clone();
        clone.stop();
        assert!(track.is_stopped());
    }

    #[test]
    fn test_fork_is_independent() {
        let track = LocalTrack::screen("screen-1");
        let fork = track.fork();

        assert_ne!(track.id(), fork.id());
        assert_eq!(track.stream_id(), fork.stream_id());
        assert!(fork.is_screen());

        fork.stop();
        assert!(fork.is_stopped());
        assert!(!track.is_stopped());
    }

    #[tokio::test]
    async fn test_acquire_creates_shared_stream() {
        let media = LocalMedia::new();
        let tracks = media.acquire(MediaConstraints::default()).await.unwrap();

        assert_eq!(tracks.len(), 2);
        let stream_ids: Vec<_> = tracks.iter().map(|t| t.stream_id().to_string()).collect();
        assert_eq!(stream_ids[0], stream_ids[1]);
        assert_eq!(media.local_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent_while_live() {
        let media = LocalMedia::new();
        let first = media.acquire(MediaConstraints::default()).await.unwrap();
        let second = media.acquire(MediaConstraints::default()).await.unwrap();

        let first_ids: Vec<_> = first.iter().map(|t| t.id().to_string()).collect();
        let second_ids: Vec<_> = second.iter().map(|t| t.id().to_string()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_acquire_rejects_empty_constraints() {
        let media = LocalMedia::new();
        let err = media
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedConstraints(_)));
    }

    #[tokio::test]
    async fn test_stop_local_stops_handed_out_tracks() {
        let media = LocalMedia::new();
        let tracks = media
            .acquire(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();

        media.stop_local();

        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert!(media.local_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_screen_track_lifecycle() {
        let media = LocalMedia::new();
        assert!(media.screen_track().is_none());

        let screen = media.acquire_screen().await.unwrap();
        assert_eq!(media.screen_track().map(|t| t.id().to_string()), Some(screen.id().to_string()));

        // Stopping local camera/mic leaves screen capture alone
        media.stop_local();
        assert!(media.screen_track().is_some());

        screen.stop();
        assert!(media.screen_track().is_none());
    }
}
