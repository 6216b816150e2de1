//! Local capture and the shared stream/track handles carried by every
//! connection.

mod synthetic;

pub use synthetic::SyntheticDevices;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::MediaError;
use crate::ids::random_suffix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
struct TrackState {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Reference-counted track handle. Clones observe the same enabled/live
/// state, so toggling the local track is visible on every connection that
/// carries it.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackState>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackState {
                id: format!("{kind}-{}", random_suffix()),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Ends the track. Returns `false` if it had already ended.
    pub(crate) fn stop(&self) -> bool {
        self.inner.live.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: format!("stream-{}", random_suffix()),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }
}

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

/// Capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError>;
}

/// The local participant's capture stream, mute/camera state and display
/// name. Owns the stream: nothing else toggles or stops its tracks.
#[derive(Debug)]
pub struct LocalMediaSession {
    stream: Option<MediaStream>,
    display_name: String,
    released: bool,
}

impl LocalMediaSession {
    pub async fn acquire(
        devices: &dyn MediaDevices,
        constraints: MediaConstraints,
    ) -> Result<Self, MediaError> {
        let stream = devices.get_user_media(constraints).await?;
        info!(
            target = "huddle::media",
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        Ok(Self {
            stream: Some(stream),
            display_name: format!("User {}", random_suffix()),
            released: false,
        })
    }

    /// A session that never acquired anything. Releasing it is a no-op.
    pub fn empty() -> Self {
        Self {
            stream: None,
            display_name: format!("User {}", random_suffix()),
            released: false,
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_muted(&self) -> bool {
        self.track(TrackKind::Audio)
            .is_some_and(|track| !track.is_enabled())
    }

    pub fn is_video_off(&self) -> bool {
        self.track(TrackKind::Video)
            .is_some_and(|track| !track.is_enabled())
    }

    /// Flips the first audio track. Returns whether audio is now muted.
    pub fn toggle_audio(&mut self) -> bool {
        self.toggle(TrackKind::Audio);
        self.is_muted()
    }

    /// Flips the first video track. Returns whether video is now off.
    pub fn toggle_video(&mut self) -> bool {
        self.toggle(TrackKind::Video);
        self.is_video_off()
    }

    /// Returns whether the name changed. Blank names are ignored.
    pub fn rename(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name == self.display_name {
            return false;
        }
        self.display_name = name.to_string();
        true
    }

    /// Stops every track. Returns the number of tracks stopped; zero on any
    /// call after the first.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let stopped = self
            .stream
            .as_ref()
            .map(|stream| stream.tracks().iter().filter(|track| track.stop()).count())
            .unwrap_or(0);
        info!(target = "huddle::media", stopped, "local media released");
        stopped
    }

    fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.stream.as_ref()?.first_track(kind)
    }

    fn toggle(&mut self, kind: TrackKind) {
        if self.released {
            return;
        }
        match self.track(kind) {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                debug!(target = "huddle::media", %kind, enabled, "track toggled");
            }
            None => debug!(target = "huddle::media", %kind, "no track to toggle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn acquire(devices: &SyntheticDevices) -> LocalMediaSession {
        LocalMediaSession::acquire(devices, MediaConstraints::default())
            .await
            .expect("synthetic capture")
    }

    #[tokio::test]
    async fn toggles_flip_the_shared_tracks() {
        let devices = SyntheticDevices::new();
        let mut session = acquire(&devices).await;
        let carried = session.stream().cloned().expect("stream");

        assert!(!session.is_muted());
        assert!(session.toggle_audio());
        assert!(session.is_muted());
        let remote_view = carried.first_track(TrackKind::Audio).unwrap();
        assert!(!remote_view.is_enabled());

        assert!(session.toggle_video());
        assert!(!session.toggle_video());
        assert!(carried.first_track(TrackKind::Video).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn toggling_a_missing_track_changes_nothing() {
        let devices = SyntheticDevices::new().without_camera();
        let mut session =
            LocalMediaSession::acquire(&devices, MediaConstraints { audio: true, video: false })
                .await
                .unwrap();
        assert!(!session.toggle_video());
        assert!(!session.is_video_off());
    }

    #[tokio::test]
    async fn release_happens_once() {
        let devices = SyntheticDevices::new();
        let mut session = acquire(&devices).await;
        assert_eq!(session.release(), 2);
        assert_eq!(session.release(), 0);
        assert!(devices.issued().iter().all(|stream| !stream.is_live()));

        let mut never_acquired = LocalMediaSession::empty();
        assert_eq!(never_acquired.release(), 0);
        assert!(never_acquired.is_released());
    }

    #[test]
    fn blank_renames_keep_the_previous_name() {
        let mut session = LocalMediaSession::empty();
        assert!(session.display_name().starts_with("User "));
        assert!(session.rename("  Dana "));
        assert_eq!(session.display_name(), "Dana");
        assert!(!session.rename("   "));
        assert!(!session.rename("Dana"));
        assert_eq!(session.display_name(), "Dana");
    }
}
