//! Room discovery over a signaling channel.
//!
//! A [`SignalingClient`] is scoped to one room: it announces the local
//! participant and turns what the channel reports about everyone else into
//! [`SignalingEvent`]s. Events about the local participant itself are never
//! delivered.

pub mod local;
pub mod protocol;
pub mod websocket;

pub use local::{LocalSignalingClient, LocalSignalingHub};
pub use websocket::WsSignalingClient;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::ids::{ParticipantId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Joined(ParticipantId),
    Left(ParticipantId),
    NameChanged {
        participant: ParticipantId,
        name: String,
    },
    /// The participant accepts incoming calls.
    Ready(ParticipantId),
    Disconnected {
        reason: String,
    },
}

impl SignalingEvent {
    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEvent::Joined(id) | SignalingEvent::Left(id) | SignalingEvent::Ready(id) => {
                Some(id)
            }
            SignalingEvent::NameChanged { participant, .. } => Some(participant),
            SignalingEvent::Disconnected { .. } => None,
        }
    }
}

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Opens the channel for `room`. Calling it again after
    /// [`disconnect`](Self::disconnect) reopens it.
    async fn connect(&self, room: &RoomId) -> Result<(), SignalingError>;

    /// Joins the room and resolves once the channel confirms the local
    /// participant's membership.
    async fn announce(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError>;

    /// Take-once receiver for room events. Events are buffered from the moment
    /// the client is built.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

    async fn emit_name_changed(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        name: &str,
    ) -> Result<(), SignalingError>;

    async fn emit_ready(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError>;

    /// Leaves the room and closes the channel. Safe to call repeatedly.
    async fn disconnect(&self);
}
