use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use super::{SignalingClient, SignalingEvent};
use crate::config::Config;
use crate::error::SignalingError;
use crate::ids::{ParticipantId, RoomId};

const CLOSE_GRACE: Duration = Duration::from_millis(500);

type JoinWaiter = Arc<Mutex<Option<oneshot::Sender<Result<(), SignalingError>>>>>;

/// Signaling over a websocket to `{signaling_url}/ws/{room}`.
pub struct WsSignalingClient {
    signaling_url: String,
    heartbeat_interval: Duration,
    link: Mutex<Option<Link>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

struct Link {
    room: RoomId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    local: Arc<RwLock<Option<ParticipantId>>>,
    join_waiter: JoinWaiter,
    /// Set once the server confirms our join; cleared when the link is torn
    /// down. Only an established link reports `Disconnected`.
    established: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl WsSignalingClient {
    pub fn new(signaling_url: impl Into<String>, heartbeat_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            signaling_url: signaling_url.into(),
            heartbeat_interval,
            link: Mutex::new(None),
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.signaling_url.clone(), config.heartbeat_interval)
    }

    fn sender_for(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<mpsc::UnboundedSender<ClientMessage>, SignalingError> {
        let guard = self.link.lock();
        let link = guard
            .as_ref()
            .filter(|link| &link.room == room)
            .ok_or(SignalingError::NotConnected)?;
        if link.local.read().as_ref() != Some(participant) {
            return Err(SignalingError::NotConnected);
        }
        Ok(link.send_tx.clone())
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    async fn connect(&self, room: &RoomId) -> Result<(), SignalingError> {
        let current = self.link.lock().as_ref().map(|link| link.room.clone());
        if let Some(current) = current {
            if &current == room {
                return Ok(());
            }
            return Err(SignalingError::Setup(format!(
                "already connected to room {current}"
            )));
        }

        let websocket_url = derive_websocket_url(&self.signaling_url, room)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "huddle::signaling",
            url = %websocket_url,
            "signaling websocket connected"
        );
        let (mut ws_write, ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let local = Arc::new(RwLock::new(None));
        let join_waiter: JoinWaiter = Arc::new(Mutex::new(None));
        let established = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "huddle::signaling", error = %err, "failed to encode frame");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(read_frames(
            ws_read,
            Arc::clone(&local),
            Arc::clone(&join_waiter),
            Arc::clone(&established),
            self.events_tx.clone(),
        ));

        let heartbeat_tx = send_tx.clone();
        let period = self.heartbeat_interval.max(Duration::from_millis(10));
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        *self.link.lock() = Some(Link {
            room: room.clone(),
            send_tx,
            local,
            join_waiter,
            established,
            writer,
            reader,
            heartbeat,
        });
        Ok(())
    }

    async fn announce(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError> {
        let (send_tx, confirmed) = {
            let guard = self.link.lock();
            let link = guard
                .as_ref()
                .filter(|link| &link.room == room)
                .ok_or(SignalingError::NotConnected)?;
            *link.local.write() = Some(participant.clone());
            let (tx, rx) = oneshot::channel();
            *link.join_waiter.lock() = Some(tx);
            (link.send_tx.clone(), rx)
        };

        send_tx
            .send(ClientMessage::JoinRoom {
                room_id: room.clone(),
                participant_id: participant.clone(),
            })
            .map_err(|_| SignalingError::ChannelClosed)?;
        tracing::debug!(target = "huddle::signaling", %room, %participant, "sent join-room");

        match confirmed.await {
            Ok(result) => {
                if result.is_ok() {
                    tracing::debug!(target = "huddle::signaling", %room, "room join confirmed");
                }
                result
            }
            Err(_) => Err(SignalingError::ChannelClosed),
        }
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
        self.sender_for(room, participant)?
            .send(ClientMessage::NameChange {
                room_id: room.clone(),
                participant_id: participant.clone(),
                name: name.to_string(),
            })
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn emit_ready(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SignalingError> {
        self.sender_for(room, participant)?
            .send(ClientMessage::Ready {
                room_id: room.clone(),
                participant_id: participant.clone(),
            })
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn disconnect(&self) {
        let link = self.link.lock().take();
        let Some(Link {
            room,
            send_tx,
            established,
            reader,
            heartbeat,
            mut writer,
            ..
        }) = link
        else {
            return;
        };
        established.store(false, Ordering::Release);
        heartbeat.abort();
        reader.abort();
        // Dropping the last sender lets the writer flush and send a close frame.
        drop(send_tx);
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            tracing::debug!(target = "huddle::signaling", %room, "writer did not close in time");
            writer.abort();
        }
        tracing::debug!(target = "huddle::signaling", %room, "signaling disconnected");
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.established.store(false, Ordering::Release);
            link.writer.abort();
            link.reader.abort();
            link.heartbeat.abort();
        }
    }
}

async fn read_frames<S>(
    mut ws_read: S,
    local: Arc<RwLock<Option<ParticipantId>>>,
    join_waiter: JoinWaiter,
    established: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => {
                tracing::trace!(target = "huddle::signaling", event = "ws_in", len = text.len());
                handle_frame(&text, &local, &join_waiter, &established, &events);
            }
            Some(Ok(Message::Binary(data))) => {
                if let Ok(text) = String::from_utf8(data) {
                    handle_frame(&text, &local, &join_waiter, &established, &events);
                }
            }
            Some(Ok(Message::Close(_))) => break "server closed the connection".to_string(),
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "huddle::signaling", "signaling websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "huddle::signaling", "signaling websocket error: {err}");
                    }
                }
                break err.to_string();
            }
            None => break "websocket stream ended".to_string(),
        }
    };

    if let Some(waiter) = join_waiter.lock().take() {
        let _ = waiter.send(Err(SignalingError::ChannelClosed));
    }
    // A link that never confirmed the join, or that was already torn down,
    // fails the announcement instead.
    if established.swap(false, Ordering::AcqRel) {
        let _ = events.send(SignalingEvent::Disconnected { reason });
    } else {
        tracing::debug!(target = "huddle::signaling", %reason, "unestablished link closed");
    }
}

fn handle_frame(
    text: &str,
    local: &RwLock<Option<ParticipantId>>,
    join_waiter: &JoinWaiter,
    established: &AtomicBool,
    events: &mpsc::UnboundedSender<SignalingEvent>,
) {
    let frame = match serde_json::from_str::<ServerMessage>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(target = "huddle::signaling", error = %err, "ignoring unrecognised frame");
            return;
        }
    };
    match frame {
        ServerMessage::RoomJoined { participant_id, .. } => {
            if local.read().as_ref() == Some(&participant_id) {
                established.store(true, Ordering::Release);
                if let Some(waiter) = join_waiter.lock().take() {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
        ServerMessage::Error { message } => match join_waiter.lock().take() {
            Some(waiter) => {
                let _ = waiter.send(Err(SignalingError::Server(message)));
            }
            None => {
                tracing::warn!(target = "huddle::signaling", %message, "signaling server error");
            }
        },
        ServerMessage::Pong => {
            tracing::trace!(target = "huddle::signaling", "heartbeat acknowledged");
        }
        other => {
            let local = local.read().clone();
            if let Some(event) = other.into_event(local.as_ref()) {
                let _ = events.send(event);
            }
        }
    }
}

fn derive_websocket_url(signaling_url: &str, room: &RoomId) -> Result<Url, SignalingError> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        SignalingError::Setup(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Setup("invalid websocket scheme".into()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SignalingError::Setup("signaling url cannot carry a path".into()))?;
        segments.pop_if_empty().push("ws").push(room.as_str());
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("k3x9qa").unwrap()
    }

    #[test]
    fn websocket_url_follows_the_http_scheme() {
        let url = derive_websocket_url("http://127.0.0.1:5000", &room()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:5000/ws/k3x9qa");

        let url = derive_websocket_url("https://signal.example.com/base/?x=1#frag", &room()).unwrap();
        assert_eq!(url.as_str(), "wss://signal.example.com/base/ws/k3x9qa");

        assert!(matches!(
            derive_websocket_url("ftp://example.com", &room()),
            Err(SignalingError::Setup(_))
        ));
    }

    #[tokio::test]
    async fn frames_resolve_the_join_and_skip_our_own_events() {
        let me = ParticipantId::new("k3x9qa-1-me0000").unwrap();
        let other = ParticipantId::new("k3x9qa-2-other0").unwrap();
        let local = RwLock::new(Some(me.clone()));
        let (tx, rx) = oneshot::channel();
        let waiter: JoinWaiter = Arc::new(Mutex::new(Some(tx)));
        let established = AtomicBool::new(false);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let frame = |message: ServerMessage| serde_json::to_string(&message).unwrap();
        handle_frame(
            &frame(ServerMessage::RoomJoined {
                room_id: room(),
                participant_id: other.clone(),
            }),
            &local,
            &waiter,
            &established,
            &events_tx,
        );
        assert!(waiter.lock().is_some(), "another participant's confirmation");
        assert!(!established.load(Ordering::Acquire));

        handle_frame(
            &frame(ServerMessage::RoomJoined {
                room_id: room(),
                participant_id: me.clone(),
            }),
            &local,
            &waiter,
            &established,
            &events_tx,
        );
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(established.load(Ordering::Acquire));

        handle_frame(
            &frame(ServerMessage::UserConnected {
                participant_id: me.clone(),
            }),
            &local,
            &waiter,
            &established,
            &events_tx,
        );
        handle_frame(
            &frame(ServerMessage::UserConnected {
                participant_id: other.clone(),
            }),
            &local,
            &waiter,
            &established,
            &events_tx,
        );
        handle_frame("{\"type\":\"mystery\"}", &local, &waiter, &established, &events_tx);
        assert_eq!(events_rx.recv().await, Some(SignalingEvent::Joined(other)));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_an_established_link_reports_disconnects() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let closed = || futures_util::stream::iter(vec![Ok::<_, WsError>(Message::Close(None))]);

        let (tx, rx) = oneshot::channel();
        read_frames(
            closed(),
            Arc::new(RwLock::new(None)),
            Arc::new(Mutex::new(Some(tx))),
            Arc::new(AtomicBool::new(false)),
            events_tx.clone(),
        )
        .await;
        assert_eq!(rx.await.unwrap(), Err(SignalingError::ChannelClosed));
        assert!(events_rx.try_recv().is_err());

        read_frames(
            closed(),
            Arc::new(RwLock::new(None)),
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicBool::new(true)),
            events_tx,
        )
        .await;
        assert_eq!(
            events_rx.recv().await,
            Some(SignalingEvent::Disconnected {
                reason: "server closed the connection".into()
            })
        );
    }
}
