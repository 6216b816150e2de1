use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use room_bus::{Bus, BusError, BusMessage, RoomBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::ServerMessage;
use super::{SignalingClient, SignalingEvent};
use crate::error::SignalingError;
use crate::ids::{ParticipantId, RoomId};

/// In-process signaling channel. Each room is a topic on a shared
/// [`RoomBus`]; clients built from the same hub see each other.
#[derive(Clone, Default)]
pub struct LocalSignalingHub {
    bus: Arc<RoomBus>,
    unresponsive: Arc<AtomicBool>,
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub whose rooms buffer at most `capacity` undelivered frames per
    /// subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bus: Arc::new(RoomBus::with_capacity(capacity)),
            unresponsive: Arc::default(),
        }
    }

    pub fn client(&self) -> LocalSignalingClient {
        LocalSignalingClient::new(self.clone())
    }

    /// While set, announcements are never confirmed.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Release);
    }

    pub fn members(&self, room: &RoomId) -> Vec<ParticipantId> {
        self.bus
            .members(room.as_str())
            .into_iter()
            .filter_map(|member| ParticipantId::new(member).ok())
            .collect()
    }

    /// Rooms still held open by a member or a subscription.
    pub fn open_rooms(&self) -> usize {
        self.bus.topic_count()
    }

    fn publish(
        &self,
        room: &RoomId,
        sender: &ParticipantId,
        message: &ServerMessage,
    ) -> Result<usize, SignalingError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| SignalingError::Setup(format!("failed to encode frame: {err}")))?;
        self.bus
            .publish(room.as_str(), sender.as_str(), Bytes::from(payload))
            .map_err(|err| match err {
                BusError::NotMember { .. } => SignalingError::NotConnected,
            })
    }
}

#[derive(Default)]
struct Link {
    room: Option<RoomId>,
    subscription: Option<broadcast::Receiver<BusMessage>>,
    joined: Option<ParticipantId>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct LocalSignalingClient {
    hub: LocalSignalingHub,
    link: Mutex<Link>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl LocalSignalingClient {
    fn new(hub: LocalSignalingHub) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            hub,
            link: Mutex::new(Link::default()),
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
        }
    }

    fn joined_as(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), SignalingError> {
        let link = self.link.lock();
        match (&link.room, &link.joined) {
            (Some(current), Some(joined)) if current == room && joined == participant => Ok(()),
            _ => Err(SignalingError::NotConnected),
        }
    }

    fn leave_room(&self) {
        let link = std::mem::take(&mut *self.link.lock());
        drop(link.subscription);
        if let Some(forwarder) = link.forwarder {
            forwarder.abort();
        }
        if let (Some(room), Some(participant)) = (link.room, link.joined) {
            let farewell = ServerMessage::UserDisconnected {
                participant_id: participant.clone(),
            };
            if let Err(err) = self.hub.publish(&room, &participant, &farewell) {
                debug!(target = "huddle::signaling", error = %err, "farewell not delivered");
            }
            self.hub.bus.leave(room.as_str(), participant.as_str());
            debug!(target = "huddle::signaling", %room, %participant, "left local room");
        }
    }
}

async fn forward_room_events(
    mut subscription: broadcast::Receiver<BusMessage>,
    local: ParticipantId,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    loop {
        match subscription.recv().await {
            Ok(message) => {
                if message.sender == local.as_str() {
                    continue;
                }
                let frame = match serde_json::from_slice::<ServerMessage>(&message.payload) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target = "huddle::signaling", error = %err, "undecodable room frame");
                        continue;
                    }
                };
                if let Some(event) = frame.into_event(Some(&local)) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            // Lost frames may include joins, so the channel can no longer be
            // trusted.
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "huddle::signaling", skipped, "room events dropped");
                let _ = events.send(SignalingEvent::Disconnected {
                    reason: format!("missed {skipped} room events"),
                });
                break;
            }
            Err(RecvError::Closed) => {
                let _ = events.send(SignalingEvent::Disconnected {
                    reason: "room bus closed".into(),
                });
                break;
            }
        }
    }
}

#[async_trait]
impl SignalingClient for LocalSignalingClient {
    async fn connect(&self, room: &RoomId) -> Result<(), SignalingError> {
        let mut link = self.link.lock();
        if link.room.as_ref() == Some(room) {
            return Ok(());
        }
        if link.room.is_some() {
            return Err(SignalingError::Setup(
                "client is already connected to another room".into(),
            ));
        }
        link.room = Some(room.clone());
        link.subscription = Some(self.hub.bus.subscribe(room.as_str()));
        debug!(target = "huddle::signaling", %room, "connected to local room");
        Ok(())
    }

    async fn announce(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError> {
        if self.hub.unresponsive.load(Ordering::Acquire) {
            return std::future::pending().await;
        }

        let subscription = {
            let mut link = self.link.lock();
            if link.room.as_ref() != Some(room) {
                return Err(SignalingError::NotConnected);
            }
            if link.joined.as_ref() == Some(participant) {
                return Ok(());
            }
            let subscription = link
                .subscription
                .take()
                .ok_or(SignalingError::NotConnected)?;
            link.joined = Some(participant.clone());
            subscription
        };

        self.hub.bus.join(room.as_str(), participant.as_str());
        let forwarder = tokio::spawn(forward_room_events(
            subscription,
            participant.clone(),
            self.events_tx.clone(),
        ));
        self.link.lock().forwarder = Some(forwarder);

        let hello = ServerMessage::UserConnected {
            participant_id: participant.clone(),
        };
        let reached = self.hub.publish(room, participant, &hello)?;
        debug!(target = "huddle::signaling", %room, %participant, reached, "joined local room");
        Ok(())
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(SignalingError::EventsTaken)
    }

    async fn emit_name_changed(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        name: &str,
    ) -> Result<(), SignalingError> {
        self.joined_as(room, participant)?;
        let message = ServerMessage::NameChange {
            room_id: room.clone(),
            participant_id: participant.clone(),
            name: name.to_string(),
        };
        self.hub.publish(room, participant, &message).map(|_| ())
    }

    async fn emit_ready(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError> {
        self.joined_as(room, participant)?;
        let message = ServerMessage::Ready {
            participant_id: participant.clone(),
        };
        self.hub.publish(room, participant, &message).map(|_| ())
    }

    async fn disconnect(&self) {
        self.leave_room();
    }
}

impl Drop for LocalSignalingClient {
    fn drop(&mut self) {
        self.leave_room();
    }
}
