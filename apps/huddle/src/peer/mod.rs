//! Pairwise media connections.
//!
//! A [`MediaConnector`] places and answers calls on behalf of one local
//! participant and reports what happens to them afterwards as
//! [`ConnectorEvent`]s on the receiver returned by [`MediaConnector::open`].

mod loopback;

pub use loopback::{LoopbackConnector, LoopbackNetwork};

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::RendezvousConfig;
use crate::error::ConnectionError;
use crate::ids::{ConnectionId, ParticipantId};
use crate::media::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outgoing => f.write_str("outgoing"),
            CallDirection::Incoming => f.write_str("incoming"),
        }
    }
}

/// Local handle to one pairwise connection.
pub trait MediaConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;
    fn remote(&self) -> &ParticipantId;
    fn is_open(&self) -> bool;
    /// Closing an already closed connection succeeds.
    fn close(&self) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub connection_id: ConnectionId,
    pub remote: ParticipantId,
}

#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Incoming(IncomingCall),
    Stream {
        connection_id: ConnectionId,
        remote: ParticipantId,
        stream: MediaStream,
    },
    Closed {
        connection_id: ConnectionId,
        remote: ParticipantId,
    },
    Failed {
        connection_id: ConnectionId,
        remote: ParticipantId,
        error: ConnectionError,
    },
}

#[async_trait]
pub trait MediaConnector: Send + Sync {
    /// Registers the local participant with the rendezvous service.
    async fn open(
        &self,
        local: &ParticipantId,
        rendezvous: &RendezvousConfig,
    ) -> Result<mpsc::UnboundedReceiver<ConnectorEvent>, ConnectionError>;

    /// Places an outgoing call offering `stream`. Resolves once the remote
    /// side has the call; the remote stream follows as a
    /// [`ConnectorEvent::Stream`].
    async fn call(
        &self,
        remote: &ParticipantId,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>, ConnectionError>;

    fn answer(
        &self,
        call: &IncomingCall,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>, ConnectionError>;

    /// Closes every connection and unregisters the local participant.
    async fn shutdown(&self);
}
