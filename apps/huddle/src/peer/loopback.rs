use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ConnectorEvent, IncomingCall, MediaConnection, MediaConnector};
use crate::config::RendezvousConfig;
use crate::error::ConnectionError;
use crate::ids::{ConnectionId, ParticipantId};
use crate::media::MediaStream;

/// In-process stand-in for the connection library and its rendezvous
/// service. Every participant opens a [`LoopbackConnector`] on the same
/// network; calls are delivered to the callee's event stream and answered
/// streams are exchanged by reference.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    state: Mutex<NetworkState>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<ParticipantId, mpsc::UnboundedSender<ConnectorEvent>>,
    links: HashMap<ConnectionId, Link>,
    unreachable: HashSet<ParticipantId>,
    failing_close: HashSet<ParticipantId>,
    call_latency: Duration,
}

struct Link {
    caller: ParticipantId,
    callee: ParticipantId,
    caller_stream: MediaStream,
}

impl NetworkState {
    fn notify(&self, participant: &ParticipantId, event: ConnectorEvent) {
        if let Some(endpoint) = self.endpoints.get(participant) {
            let _ = endpoint.send(event);
        }
    }

    fn drop_link(&mut self, id: ConnectionId) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };
        self.notify(
            &link.caller,
            ConnectorEvent::Closed {
                connection_id: id,
                remote: link.callee.clone(),
            },
        );
        self.notify(
            &link.callee,
            ConnectorEvent::Closed {
                connection_id: id,
                remote: link.caller.clone(),
            },
        );
        true
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            local: Mutex::new(None),
        }
    }

    /// Calls to `participant` fail negotiation.
    pub fn fail_calls_to(&self, participant: ParticipantId) {
        self.inner.state.lock().unreachable.insert(participant);
    }

    /// Closing a connection whose remote is `participant` reports an error.
    /// The connection still goes away.
    pub fn fail_close_with(&self, participant: ParticipantId) {
        self.inner.state.lock().failing_close.insert(participant);
    }

    /// Delay before an outgoing call reaches the callee.
    pub fn set_call_latency(&self, latency: Duration) {
        self.inner.state.lock().call_latency = latency;
    }

    pub fn is_registered(&self, participant: &ParticipantId) -> bool {
        self.inner.state.lock().endpoints.contains_key(participant)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    pub fn connections_between(&self, a: &ParticipantId, b: &ParticipantId) -> usize {
        self.inner
            .state
            .lock()
            .links
            .values()
            .filter(|link| {
                (&link.caller == a && &link.callee == b) || (&link.caller == b && &link.callee == a)
            })
            .count()
    }

    fn register(
        &self,
        local: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<ConnectorEvent>, ConnectionError> {
        let mut state = self.inner.state.lock();
        if state.endpoints.contains_key(local) {
            return Err(ConnectionError::Transport(format!(
                "{local} is already registered"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(local.clone(), tx);
        Ok(rx)
    }

    fn unregister(&self, local: &ParticipantId) {
        let mut state = self.inner.state.lock();
        state.endpoints.remove(local);
        let owned: Vec<ConnectionId> = state
            .links
            .iter()
            .filter(|(_, link)| &link.caller == local || &link.callee == local)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            state.drop_link(id);
        }
    }

    fn call_latency(&self) -> Duration {
        self.inner.state.lock().call_latency
    }

    fn connect(
        &self,
        caller: &ParticipantId,
        callee: &ParticipantId,
        stream: &MediaStream,
    ) -> Result<LoopbackConnection, ConnectionError> {
        let mut state = self.inner.state.lock();
        if !state.endpoints.contains_key(caller) {
            return Err(ConnectionError::NotOpen);
        }
        if state.unreachable.contains(callee) {
            return Err(ConnectionError::Negotiation {
                participant: callee.clone(),
                reason: "remote rejected the offer".into(),
            });
        }
        if !state.endpoints.contains_key(callee) {
            return Err(ConnectionError::Unreachable(callee.clone()));
        }

        let id = ConnectionId::new(self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        state.links.insert(
            id,
            Link {
                caller: caller.clone(),
                callee: callee.clone(),
                caller_stream: stream.clone(),
            },
        );
        state.notify(
            callee,
            ConnectorEvent::Incoming(IncomingCall {
                connection_id: id,
                remote: caller.clone(),
            }),
        );
        trace!(target = "huddle::peer", connection = %id, %caller, %callee, "loopback call placed");
        Ok(LoopbackConnection {
            id,
            remote: callee.clone(),
            network: self.clone(),
        })
    }

    fn accept(
        &self,
        callee: &ParticipantId,
        call: &IncomingCall,
        stream: &MediaStream,
    ) -> Result<LoopbackConnection, ConnectionError> {
        let state = self.inner.state.lock();
        let link = state
            .links
            .get(&call.connection_id)
            .filter(|link| &link.callee == callee)
            .ok_or(ConnectionError::AlreadyClosed(call.connection_id))?;
        let caller = link.caller.clone();
        let caller_stream = link.caller_stream.clone();

        state.notify(
            &caller,
            ConnectorEvent::Stream {
                connection_id: call.connection_id,
                remote: callee.clone(),
                stream: stream.clone(),
            },
        );
        state.notify(
            callee,
            ConnectorEvent::Stream {
                connection_id: call.connection_id,
                remote: caller.clone(),
                stream: caller_stream,
            },
        );
        Ok(LoopbackConnection {
            id: call.connection_id,
            remote: caller,
            network: self.clone(),
        })
    }

    fn close(&self, id: ConnectionId, remote: &ParticipantId) -> Result<(), ConnectionError> {
        let mut state = self.inner.state.lock();
        let dropped = state.drop_link(id);
        if state.failing_close.contains(remote) {
            return Err(ConnectionError::Transport(format!(
                "closing {id} to {remote} failed"
            )));
        }
        if dropped {
            trace!(target = "huddle::peer", connection = %id, %remote, "loopback connection closed");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackConnection {
    id: ConnectionId,
    remote: ParticipantId,
    network: LoopbackNetwork,
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork").finish_non_exhaustive()
    }
}

impl MediaConnection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.network.inner.state.lock().links.contains_key(&self.id)
    }

    fn close(&self) -> Result<(), ConnectionError> {
        self.network.close(self.id, &self.remote)
    }
}

/// One participant's view of a [`LoopbackNetwork`].
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    local: Mutex<Option<ParticipantId>>,
}

impl LoopbackConnector {
    fn local(&self) -> Result<ParticipantId, ConnectionError> {
        self.local.lock().clone().ok_or(ConnectionError::NotOpen)
    }
}

#[async_trait]
impl MediaConnector for LoopbackConnector {
    async fn open(
        &self,
        local: &ParticipantId,
        rendezvous: &RendezvousConfig,
    ) -> Result<mpsc::UnboundedReceiver<ConnectorEvent>, ConnectionError> {
        let events = self.network.register(local)?;
        *self.local.lock() = Some(local.clone());
        debug!(
            target = "huddle::peer",
            participant = %local,
            rendezvous = %rendezvous.endpoint(),
            "registered with loopback rendezvous"
        );
        Ok(events)
    }

    async fn call(
        &self,
        remote: &ParticipantId,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>, ConnectionError> {
        let local = self.local()?;
        let latency = self.network.call_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let connection = self.network.connect(&local, remote, stream)?;
        Ok(Box::new(connection))
    }

    fn answer(
        &self,
        call: &IncomingCall,
        stream: &MediaStream,
    ) -> Result<Box<dyn MediaConnection>, ConnectionError> {
        let local = self.local()?;
        let connection = self.network.accept(&local, call, stream)?;
        Ok(Box::new(connection))
    }

    async fn shutdown(&self) {
        let local = self.local.lock().take();
        if let Some(local) = local {
            self.network.unregister(&local);
            debug!(target = "huddle::peer", participant = %local, "loopback endpoint closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};

    fn pid(raw: &str) -> ParticipantId {
        ParticipantId::new(raw).unwrap()
    }

    fn stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "mic")])
    }

    #[tokio::test]
    async fn answered_calls_exchange_streams() {
        let network = LoopbackNetwork::new();
        let rendezvous = RendezvousConfig::default();
        let (alice, bob) = (pid("r-1-alice"), pid("r-2-bob"));
        let alice_conn = network.connector();
        let bob_conn = network.connector();
        let mut alice_events = alice_conn.open(&alice, &rendezvous).await.unwrap();
        let mut bob_events = bob_conn.open(&bob, &rendezvous).await.unwrap();

        let alice_stream = stream();
        let outgoing = alice_conn.call(&bob, &alice_stream).await.unwrap();
        let ConnectorEvent::Incoming(call) = bob_events.recv().await.unwrap() else {
            panic!("expected incoming call");
        };
        assert_eq!(call.remote, alice);
        assert_eq!(call.connection_id, outgoing.id());

        let bob_stream = stream();
        let incoming = bob_conn.answer(&call, &bob_stream).unwrap();
        match alice_events.recv().await.unwrap() {
            ConnectorEvent::Stream { remote, stream, .. } => {
                assert_eq!(remote, bob);
                assert_eq!(stream.id(), bob_stream.id());
            }
            other => panic!("unexpected {other:?}"),
        }
        match bob_events.recv().await.unwrap() {
            ConnectorEvent::Stream { stream, .. } => assert_eq!(stream.id(), alice_stream.id()),
            other => panic!("unexpected {other:?}"),
        }

        incoming.close().unwrap();
        assert!(!outgoing.is_open());
        assert!(outgoing.close().is_ok());
        assert!(matches!(
            alice_events.recv().await.unwrap(),
            ConnectorEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_and_failing_callees_are_errors() {
        let network = LoopbackNetwork::new();
        let connector = network.connector();
        let local = pid("r-1-local");
        assert_eq!(
            connector.call(&pid("r-2-x"), &stream()).await.unwrap_err(),
            ConnectionError::NotOpen
        );
        let _events = connector
            .open(&local, &RendezvousConfig::default())
            .await
            .unwrap();
        assert_eq!(
            connector.call(&pid("r-2-x"), &stream()).await.unwrap_err(),
            ConnectionError::Unreachable(pid("r-2-x"))
        );

        network.fail_calls_to(local.clone());
        assert!(matches!(
            connector.call(&local, &stream()).await,
            Err(ConnectionError::Negotiation { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_every_link_of_the_endpoint() {
        let network = LoopbackNetwork::new();
        let rendezvous = RendezvousConfig::default();
        let (a, b, c) = (pid("r-1-a"), pid("r-2-b"), pid("r-3-c"));
        let ca = network.connector();
        let cb = network.connector();
        let cc = network.connector();
        let _ea = ca.open(&a, &rendezvous).await.unwrap();
        let mut eb = cb.open(&b, &rendezvous).await.unwrap();
        let _ec = cc.open(&c, &rendezvous).await.unwrap();

        let _ab = ca.call(&b, &stream()).await.unwrap();
        let _ac = ca.call(&c, &stream()).await.unwrap();
        let _bc = cb.call(&c, &stream()).await.unwrap();
        assert_eq!(network.open_connections(), 3);

        ca.shutdown().await;
        assert!(!network.is_registered(&a));
        assert_eq!(network.open_connections(), 1);
        assert_eq!(network.connections_between(&b, &c), 1);

        let _incoming = eb.recv().await.unwrap();
        match eb.recv().await.unwrap() {
            ConnectorEvent::Closed { remote, .. } => assert_eq!(remote, a),
            other => panic!("unexpected {other:?}"),
        }
    }
}
