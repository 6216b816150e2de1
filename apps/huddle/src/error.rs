use thiserror::Error;

use crate::config::ConfigError;
use crate::ids::{ConnectionId, IdError, ParticipantId};
use crate::media::TrackKind;
use crate::view::RenderTargetId;

/// Local capture could not be started. Fatal to room entry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media capture permission denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("media capture failed: {0}")]
    Capture(String),
}

/// Failure of one pairwise connection. Local to that participant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("media connector is not open")]
    NotOpen,
    #[error("participant {0} is not reachable")]
    Unreachable(ParticipantId),
    #[error("negotiation with {participant} failed: {reason}")]
    Negotiation {
        participant: ParticipantId,
        reason: String,
    },
    #[error("connection {0} is already closed")]
    AlreadyClosed(ConnectionId),
    #[error("connection transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("signaling is not connected to a room")]
    NotConnected,
    #[error("room join was not confirmed after {attempts} attempt(s)")]
    JoinTimeout { attempts: u32 },
    #[error("signaling server error: {0}")]
    Server(String),
    #[error("signaling event stream already taken")]
    EventsTaken,
}

/// Rendering failures are logged by the view binder and never propagated
/// into the connection lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("render target {0} does not exist")]
    UnknownTarget(RenderTargetId),
    #[error("playback rejected: {0}")]
    PlaybackRejected(String),
    #[error("render surface error: {0}")]
    Surface(String),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("local media unavailable: {0}")]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("room session has already ended")]
    Closed,
}
