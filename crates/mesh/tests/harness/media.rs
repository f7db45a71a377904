//! Media sources for tests

use async_trait::async_trait;
use coderoom_mesh::media::{MediaConstraints, TrackKind, TrackSource};
use coderoom_mesh::{LocalMedia, LocalTrack, MediaError, MediaSourceProvider, TrackSet};

/// Media source with camera and microphone already running
pub fn call_media() -> LocalMedia {
    LocalMedia::with_tracks(TrackSet::new(vec![
        LocalTrack::microphone("local-stream"),
        LocalTrack::camera("local-stream"),
    ]))
}

/// Media source whose camera cannot be attached to any connection
pub fn media_with_broken_camera() -> LocalMedia {
    LocalMedia::with_tracks(TrackSet::new(vec![
        LocalTrack::microphone("local-stream"),
        LocalTrack::new(
            TrackKind::Video,
            TrackSource::Camera,
            "broken-camera",
            "local-stream",
        ),
    ]))
}

/// Media source where every acquisition fails
pub struct FailingMedia {
    pub error: MediaError,
}

#[async_trait]
impl MediaSourceProvider for FailingMedia {
    fn local_tracks(&self) -> TrackSet {
        TrackSet::default()
    }

    fn screen_track(&self) -> Option<LocalTrack> {
        None
    }

    async fn acquire(&self, _constraints: MediaConstraints) -> Result<TrackSet, MediaError> {
        Err(self.error.clone())
    }

    async fn acquire_screen(&self) -> Result<LocalTrack, MediaError> {
        Err(self.error.clone())
    }

    fn stop_local(&self) {}
}
