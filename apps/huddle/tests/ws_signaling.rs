use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use huddle_client_core::config::Config;
use huddle_client_core::error::SignalingError;
use huddle_client_core::ids::{ParticipantId, RoomId};
use huddle_client_core::media::SyntheticDevices;
use huddle_client_core::peer::LoopbackNetwork;
use huddle_client_core::room::{RoomCollaborators, RoomSession};
use huddle_client_core::signaling::protocol::{ClientMessage, ServerMessage};
use huddle_client_core::signaling::{SignalingClient, SignalingEvent, WsSignalingClient};
use huddle_client_core::view::HeadlessSurface;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Minimal room server speaking the client's frame protocol.
#[derive(Default)]
struct StubServer {
    rooms: Mutex<HashMap<String, Vec<(ParticipantId, mpsc::UnboundedSender<String>)>>>,
    pings: AtomicUsize,
    join_requests: AtomicUsize,
    /// Join requests still to be answered by dropping the socket.
    dropped_joins: AtomicUsize,
    rejected_room: Mutex<Option<String>>,
}

impl StubServer {
    fn broadcast(&self, room: &str, from: &ParticipantId, message: &ServerMessage) {
        let text = serde_json::to_string(message).unwrap();
        if let Some(members) = self.rooms.lock().get(room) {
            for (member, tx) in members {
                if member != from {
                    let _ = tx.send(text.clone());
                }
            }
        }
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, message: &ServerMessage) {
    let _ = tx.send(serde_json::to_string(message).unwrap());
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(server): State<Arc<StubServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, room, server))
}

async fn serve(socket: WebSocket, room: String, server: Arc<StubServer>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut joined: Option<ParticipantId> = None;
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        match frame {
            ClientMessage::JoinRoom {
                room_id,
                participant_id,
            } => {
                server.join_requests.fetch_add(1, Ordering::SeqCst);
                let drop_this = server
                    .dropped_joins
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if drop_this {
                    break;
                }
                if server.rejected_room.lock().as_deref() == Some(room.as_str()) {
                    reply(
                        &tx,
                        &ServerMessage::Error {
                            message: "room is full".into(),
                        },
                    );
                    continue;
                }
                server
                    .rooms
                    .lock()
                    .entry(room.clone())
                    .or_default()
                    .push((participant_id.clone(), tx.clone()));
                reply(
                    &tx,
                    &ServerMessage::RoomJoined {
                        room_id,
                        participant_id: participant_id.clone(),
                    },
                );
                server.broadcast(
                    &room,
                    &participant_id,
                    &ServerMessage::UserConnected {
                        participant_id: participant_id.clone(),
                    },
                );
                joined = Some(participant_id);
            }
            ClientMessage::NameChange {
                room_id,
                participant_id,
                name,
            } => server.broadcast(
                &room,
                &participant_id,
                &ServerMessage::NameChange {
                    room_id,
                    participant_id: participant_id.clone(),
                    name,
                },
            ),
            ClientMessage::Ready { participant_id, .. } => server.broadcast(
                &room,
                &participant_id,
                &ServerMessage::Ready {
                    participant_id: participant_id.clone(),
                },
            ),
            ClientMessage::Ping => {
                server.pings.fetch_add(1, Ordering::SeqCst);
                reply(&tx, &ServerMessage::Pong);
            }
        }
    }

    if let Some(participant) = joined {
        if let Some(members) = server.rooms.lock().get_mut(&room) {
            members.retain(|(member, _)| member != &participant);
        }
        server.broadcast(
            &room,
            &participant,
            &ServerMessage::UserDisconnected {
                participant_id: participant.clone(),
            },
        );
    }
    writer.abort();
}

async fn start_server() -> (Arc<StubServer>, SocketAddr) {
    let server = Arc::new(StubServer::default());
    let app = Router::new()
        .route("/ws/:room", get(upgrade))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (server, addr)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("signaling event")
        .expect("event stream open")
}

#[test_timeout::tokio_timeout_test(20)]
async fn clients_see_each_other_through_the_server() {
    init_tracing();
    let (_server, addr) = start_server().await;
    let url = format!("http://{addr}");
    let room = RoomId::new("ws-room").unwrap();
    let alice_id = ParticipantId::generate(&room);
    let bob_id = ParticipantId::generate(&room);

    let alice = WsSignalingClient::new(url.clone(), Duration::from_secs(30));
    let mut alice_events = alice.events().await.unwrap();
    alice.connect(&room).await.unwrap();
    alice.announce(&room, &alice_id).await.unwrap();

    let bob = WsSignalingClient::new(url, Duration::from_secs(30));
    let mut bob_events = bob.events().await.unwrap();
    bob.connect(&room).await.unwrap();
    bob.announce(&room, &bob_id).await.unwrap();
    bob.emit_ready(&room, &bob_id).await.unwrap();

    assert_eq!(next_event(&mut alice_events).await, SignalingEvent::Joined(bob_id.clone()));
    assert_eq!(next_event(&mut alice_events).await, SignalingEvent::Ready(bob_id.clone()));

    alice.emit_name_changed(&room, &alice_id, "Alice").await.unwrap();
    assert_eq!(
        next_event(&mut bob_events).await,
        SignalingEvent::NameChanged {
            participant: alice_id.clone(),
            name: "Alice".into(),
        }
    );

    bob.disconnect().await;
    assert_eq!(next_event(&mut alice_events).await, SignalingEvent::Left(bob_id.clone()));
    assert_eq!(
        bob.emit_ready(&room, &bob_id).await,
        Err(SignalingError::NotConnected)
    );
    alice.disconnect().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn server_error_fails_the_announcement() {
    let (server, addr) = start_server().await;
    *server.rejected_room.lock() = Some("full-room".into());
    let room = RoomId::new("full-room").unwrap();
    let client = WsSignalingClient::new(format!("http://{addr}"), Duration::from_secs(30));

    client.connect(&room).await.unwrap();
    let result = client.announce(&room, &ParticipantId::generate(&room)).await;
    assert_eq!(result, Err(SignalingError::Server("room is full".into())));
    client.disconnect().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn heartbeat_pings_the_server() {
    let (server, addr) = start_server().await;
    let room = RoomId::new("pings").unwrap();
    let client = WsSignalingClient::new(format!("http://{addr}"), Duration::from_millis(20));
    client.connect(&room).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.pings.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("heartbeat pings");
    client.disconnect().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_server_is_a_setup_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = WsSignalingClient::new(format!("http://{addr}"), Duration::from_secs(30));
    let result = client.connect(&RoomId::new("nowhere").unwrap()).await;
    assert!(matches!(result, Err(SignalingError::Setup(_))));
}

#[test_timeout::tokio_timeout_test(30)]
async fn join_retry_after_a_dropped_socket_keeps_signaling_connected() {
    init_tracing();
    let (server, addr) = start_server().await;
    server.dropped_joins.store(1, Ordering::SeqCst);
    let mut config = Config {
        signaling_url: format!("http://{addr}"),
        ..Config::default()
    };
    config.join.retry_backoff = Duration::from_millis(20);
    let room = RoomId::new("flaky").unwrap();
    let network = LoopbackNetwork::new();
    let collaborators = || RoomCollaborators {
        devices: Arc::new(SyntheticDevices::new()),
        signaling: Arc::new(WsSignalingClient::from_config(&config)),
        connector: Arc::new(network.connector()),
        surface: Arc::new(HeadlessSurface::new()),
    };

    let first = RoomSession::enter(config.clone(), room.clone(), collaborators())
        .await
        .unwrap();
    assert_eq!(server.join_requests.load(Ordering::SeqCst), 2);

    // A second participant forces the first room task through its backlog.
    let second = RoomSession::enter(config.clone(), room.clone(), collaborators())
        .await
        .unwrap();
    let mut updates = first.subscribe();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|snapshot| snapshot.connected_peers() == 1),
    )
    .await
    .expect("mesh after retry")
    .unwrap()
    .clone();
    assert!(snapshot.signaling_connected);
    assert!(first.snapshot().signaling_connected);

    second.leave().await.unwrap();
    first.leave().await.unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn room_sessions_connect_over_websocket_signaling() {
    init_tracing();
    let (_server, addr) = start_server().await;
    let config = Config {
        signaling_url: format!("http://{addr}"),
        ..Config::default()
    };
    let room = RoomId::new("ws-mesh").unwrap();
    let network = LoopbackNetwork::new();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let collaborators = RoomCollaborators {
            devices: Arc::new(SyntheticDevices::new()),
            signaling: Arc::new(WsSignalingClient::from_config(&config)),
            connector: Arc::new(network.connector()),
            surface: Arc::new(HeadlessSurface::new()),
        };
        handles.push(
            RoomSession::enter(config.clone(), room.clone(), collaborators)
                .await
                .unwrap(),
        );
    }

    for handle in &handles {
        let mut updates = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|snapshot| snapshot.connected_peers() == 1),
        )
        .await
        .expect("mesh over websocket")
        .unwrap();
    }

    let mut handles = handles.into_iter();
    let first = handles.next().unwrap();
    let second = handles.next().unwrap();
    let second_id = second.participant_id().clone();
    second.leave().await.unwrap();

    let mut updates = first.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|snapshot| snapshot.peers.iter().all(|peer| peer.participant != second_id)),
    )
    .await
    .expect("departure over websocket")
    .unwrap();
    first.leave().await.unwrap();
}
