use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{RenderSurface, RenderTarget, RenderTargetId};
use crate::error::ViewError;
use crate::ids::ParticipantId;
use crate::media::MediaStream;

/// What a headless tile currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub id: RenderTargetId,
    pub participant: Option<ParticipantId>,
    pub label: String,
    pub stream_id: Option<String>,
    pub playing: bool,
    pub muted: bool,
}

/// In-memory surface used by the demo and tests. Tiles are kept in creation
/// order.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    tiles: Mutex<BTreeMap<RenderTargetId, Tile>>,
    next_id: AtomicU64,
    reject_playback: AtomicBool,
    failing_destroy: Mutex<HashSet<ParticipantId>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an autoplay policy that refuses to start playback.
    pub fn reject_playback(&self, reject: bool) {
        self.reject_playback.store(reject, Ordering::Release);
    }

    /// Destroying this participant's tile fails (the tile is still removed).
    pub fn fail_destroy_for(&self, participant: ParticipantId) {
        self.failing_destroy.lock().insert(participant);
    }

    pub fn tiles(&self) -> Vec<Tile> {
        self.tiles.lock().values().cloned().collect()
    }

    pub fn tile(&self, id: RenderTargetId) -> Option<Tile> {
        self.tiles.lock().get(&id).cloned()
    }

    pub fn tile_for(&self, participant: &ParticipantId) -> Option<Tile> {
        self.tiles
            .lock()
            .values()
            .find(|tile| tile.participant.as_ref() == Some(participant))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_tile<T>(
        &self,
        target: &RenderTarget,
        f: impl FnOnce(&mut Tile) -> T,
    ) -> Result<T, ViewError> {
        let mut tiles = self.tiles.lock();
        let tile = tiles
            .get_mut(&target.id)
            .ok_or(ViewError::UnknownTarget(target.id))?;
        Ok(f(tile))
    }
}

impl RenderSurface for HeadlessSurface {
    fn create(
        &self,
        participant: Option<&ParticipantId>,
        label: &str,
    ) -> Result<RenderTarget, ViewError> {
        let id = RenderTargetId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let tile = Tile {
            id,
            participant: participant.cloned(),
            label: label.to_string(),
            stream_id: None,
            playing: false,
            muted: false,
        };
        self.tiles.lock().insert(id, tile);
        Ok(RenderTarget {
            id,
            participant: participant.cloned(),
        })
    }

    fn set_source(&self, target: &RenderTarget, stream: &MediaStream) -> Result<(), ViewError> {
        self.with_tile(target, |tile| {
            tile.stream_id = Some(stream.id().to_string());
            tile.playing = false;
        })
    }

    fn play(&self, target: &RenderTarget, muted: bool) -> Result<(), ViewError> {
        if self.reject_playback.load(Ordering::Acquire) {
            return Err(ViewError::PlaybackRejected(
                "autoplay requires a user gesture".into(),
            ));
        }
        self.with_tile(target, |tile| {
            if tile.stream_id.is_none() {
                return Err(ViewError::Surface(format!("{} has no source", tile.id)));
            }
            tile.playing = true;
            tile.muted = muted;
            Ok(())
        })?
    }

    fn relabel(&self, target: &RenderTarget, label: &str) -> Result<(), ViewError> {
        self.with_tile(target, |tile| tile.label = label.to_string())
    }

    fn destroy(&self, target: &RenderTarget) -> Result<(), ViewError> {
        self.tiles
            .lock()
            .remove(&target.id)
            .ok_or(ViewError::UnknownTarget(target.id))?;
        let failing = target
            .participant
            .as_ref()
            .is_some_and(|participant| self.failing_destroy.lock().contains(participant));
        if failing {
            return Err(ViewError::Surface(format!("{} failed to unmount", target.id)));
        }
        Ok(())
    }
}
