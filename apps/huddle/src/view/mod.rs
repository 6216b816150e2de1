//! Binding streams to render targets.
//!
//! The registry owns render targets and asks the [`ViewBinder`] to create,
//! relabel and destroy them. Attaching a stream writes the source into the
//! surface and starts playback. Surface errors are logged here and never
//! reach the connection lifecycle.

mod headless;

pub use headless::{HeadlessSurface, Tile};

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ViewError;
use crate::ids::ParticipantId;
use crate::media::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(u64);

impl RenderTargetId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RenderTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// Handle to one on-screen tile. `participant` is `None` for the local
/// preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: RenderTargetId,
    pub participant: Option<ParticipantId>,
}

/// Rendering backend.
pub trait RenderSurface: Send + Sync {
    fn create(
        &self,
        participant: Option<&ParticipantId>,
        label: &str,
    ) -> Result<RenderTarget, ViewError>;
    fn set_source(&self, target: &RenderTarget, stream: &MediaStream) -> Result<(), ViewError>;
    fn play(&self, target: &RenderTarget, muted: bool) -> Result<(), ViewError>;
    fn relabel(&self, target: &RenderTarget, label: &str) -> Result<(), ViewError>;
    fn destroy(&self, target: &RenderTarget) -> Result<(), ViewError>;
}

#[derive(Clone)]
pub struct ViewBinder {
    surface: Arc<dyn RenderSurface>,
}

impl fmt::Debug for ViewBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewBinder").finish_non_exhaustive()
    }
}

impl ViewBinder {
    pub fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self { surface }
    }

    pub fn create_target(
        &self,
        participant: Option<&ParticipantId>,
        label: &str,
    ) -> Option<RenderTarget> {
        match self.surface.create(participant, label) {
            Ok(target) => {
                debug!(
                    target = "huddle::view",
                    render_target = %target.id,
                    participant = ?participant.map(ParticipantId::as_str),
                    label,
                    "render target created"
                );
                Some(target)
            }
            Err(err) => {
                warn!(target = "huddle::view", error = %err, label, "render target creation failed");
                None
            }
        }
    }

    /// Sets the stream as the target's source and starts playback. Returns
    /// whether playback started.
    pub fn attach(&self, target: &RenderTarget, stream: &MediaStream) -> bool {
        self.attach_with(target, stream, false)
    }

    /// Local preview: played muted so the participant does not hear
    /// themselves.
    pub fn attach_preview(&self, target: &RenderTarget, stream: &MediaStream) -> bool {
        self.attach_with(target, stream, true)
    }

    fn attach_with(&self, target: &RenderTarget, stream: &MediaStream, muted: bool) -> bool {
        if let Err(err) = self.surface.set_source(target, stream) {
            warn!(
                target = "huddle::view",
                render_target = %target.id,
                error = %err,
                "failed to set render source"
            );
            return false;
        }
        match self.surface.play(target, muted) {
            Ok(()) => {
                debug!(
                    target = "huddle::view",
                    render_target = %target.id,
                    stream = %stream.id(),
                    "playback started"
                );
                true
            }
            Err(err) => {
                warn!(
                    target = "huddle::view",
                    render_target = %target.id,
                    error = %err,
                    "playback did not start"
                );
                false
            }
        }
    }

    pub fn relabel(&self, target: &RenderTarget, label: &str) {
        if let Err(err) = self.surface.relabel(target, label) {
            warn!(target = "huddle::view", render_target = %target.id, error = %err, "relabel failed");
        }
    }

    /// Destroys the target. The error is logged and handed back so teardown
    /// can count it.
    pub fn detach(&self, target: &RenderTarget) -> Result<(), ViewError> {
        self.surface.destroy(target).inspect_err(|err| {
            warn!(
                target = "huddle::view",
                render_target = %target.id,
                error = %err,
                "render target destroy failed"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};

    fn stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "cam")])
    }

    #[test]
    fn rejected_playback_is_absorbed() {
        let surface = Arc::new(HeadlessSurface::new());
        surface.reject_playback(true);
        let binder = ViewBinder::new(surface.clone());
        let participant = ParticipantId::new("room-1-aaaaaa").unwrap();

        let target = binder
            .create_target(Some(&participant), "User aaaaaa")
            .expect("target");
        let stream = stream();
        assert!(!binder.attach(&target, &stream));

        let tile = surface.tile(target.id).expect("tile kept");
        assert_eq!(tile.stream_id.as_deref(), Some(stream.id()));
        assert!(!tile.playing);
    }

    #[test]
    fn preview_plays_muted_and_detach_reports_unknown_targets() {
        let surface = Arc::new(HeadlessSurface::new());
        let binder = ViewBinder::new(surface.clone());
        let target = binder.create_target(None, "You").unwrap();
        assert!(binder.attach_preview(&target, &stream()));
        let tile = surface.tile(target.id).unwrap();
        assert!(tile.playing && tile.muted);
        assert_eq!(tile.participant, None);

        binder.detach(&target).unwrap();
        assert_eq!(
            binder.detach(&target),
            Err(ViewError::UnknownTarget(target.id))
        );
    }
}
