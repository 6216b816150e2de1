//! Turns room membership and connector events into registry mutations.
//!
//! The orchestrator is driven by a single task: every event goes through
//! [`ConnectionOrchestrator::handle`], which never blocks. Outgoing calls run
//! on spawned tasks and come back as [`OrchestratorEvent::DialResolved`];
//! dial delays come back as [`OrchestratorEvent::DialDue`]. Both carry the
//! attempt id they were started with, and results for an attempt that is no
//! longer current are discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DIAL_DELAY;
use crate::error::ConnectionError;
use crate::ids::{ConnectionId, ParticipantId};
use crate::media::{LocalMediaSession, MediaStream};
use crate::peer::{CallDirection, ConnectorEvent, IncomingCall, MediaConnection, MediaConnector};
use crate::registry::{PeerConnectionRegistry, PeerEntry, PeerState, PeerSummary, TeardownReport};
use crate::signaling::SignalingEvent;
use crate::telemetry;

/// When to call a participant that joined after us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPolicy {
    /// Wait for the participant's `ready` event.
    ReadyHandshake,
    /// Dial a fixed time after `joined`.
    FixedDelay(Duration),
}

impl Default for DialPolicy {
    fn default() -> Self {
        DialPolicy::ReadyHandshake
    }
}

impl DialPolicy {
    pub fn fixed_delay() -> Self {
        DialPolicy::FixedDelay(DEFAULT_DIAL_DELAY)
    }

    pub fn announces_ready(&self) -> bool {
        matches!(self, DialPolicy::ReadyHandshake)
    }
}

impl fmt::Display for DialPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialPolicy::ReadyHandshake => f.write_str("ready"),
            DialPolicy::FixedDelay(delay) => write!(f, "delay({}ms)", delay.as_millis()),
        }
    }
}

#[derive(Debug)]
pub enum OrchestratorEvent {
    Signaling(SignalingEvent),
    Connector(ConnectorEvent),
    DialDue {
        participant: ParticipantId,
        attempt: u64,
    },
    DialResolved {
        participant: ParticipantId,
        attempt: u64,
        result: Result<Box<dyn MediaConnection>, ConnectionError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialStage {
    AwaitingReady,
    Scheduled,
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct PendingDial {
    attempt: u64,
    stage: DialStage,
}

pub struct ConnectionOrchestrator {
    local: ParticipantId,
    policy: DialPolicy,
    media: LocalMediaSession,
    registry: PeerConnectionRegistry,
    connector: Arc<dyn MediaConnector>,
    dials: HashMap<ParticipantId, PendingDial>,
    // Remote streams that raced ahead of their own dial result.
    early_streams: HashMap<ConnectionId, (ParticipantId, MediaStream)>,
    names: HashMap<ParticipantId, String>,
    next_attempt: u64,
    internal_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    signaling_connected: bool,
    closed: bool,
}

impl ConnectionOrchestrator {
    /// Builds the orchestrator together with the receiver for its own
    /// follow-up events. The driving task feeds those back into
    /// [`handle`](Self::handle).
    pub fn new(
        local: ParticipantId,
        policy: DialPolicy,
        media: LocalMediaSession,
        registry: PeerConnectionRegistry,
        connector: Arc<dyn MediaConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            local,
            policy,
            media,
            registry,
            connector,
            dials: HashMap::new(),
            early_streams: HashMap::new(),
            names: HashMap::new(),
            next_attempt: 0,
            internal_tx,
            signaling_connected: true,
            closed: false,
        };
        (orchestrator, internal_rx)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn policy(&self) -> DialPolicy {
        self.policy
    }

    pub fn media(&self) -> &LocalMediaSession {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut LocalMediaSession {
        &mut self.media
    }

    pub fn registry(&self) -> &PeerConnectionRegistry {
        &self.registry
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.registry.summaries()
    }

    pub fn signaling_connected(&self) -> bool {
        self.signaling_connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `None` for participants that are neither known nor connected.
    pub fn peer_state(&self, participant: &ParticipantId) -> Option<PeerState> {
        if let Some(entry) = self.registry.get(participant) {
            return Some(entry.state());
        }
        self.dials.get(participant).map(|dial| match dial.stage {
            DialStage::AwaitingReady | DialStage::Scheduled => PeerState::Idle,
            DialStage::InFlight => PeerState::Connecting,
        })
    }

    pub fn handle(&mut self, event: OrchestratorEvent) {
        if self.closed {
            debug!(target = "huddle::orchestrator", ?event, "room closed; ignoring event");
            return;
        }
        match event {
            OrchestratorEvent::Signaling(event) => self.on_signaling(event),
            OrchestratorEvent::Connector(event) => self.on_connector(event),
            OrchestratorEvent::DialDue {
                participant,
                attempt,
            } => self.on_dial_due(participant, attempt),
            OrchestratorEvent::DialResolved {
                participant,
                attempt,
                result,
            } => self.on_dial_resolved(participant, attempt, result),
        }
    }

    /// Tears every connection down and releases local media. Further events
    /// are ignored.
    pub fn shutdown(&mut self) -> TeardownReport {
        if self.closed {
            return TeardownReport::default();
        }
        self.closed = true;
        self.dials.clear();
        self.early_streams.clear();
        let mut report = self.registry.remove_all();
        report.media_tracks_stopped = self.media.release();
        info!(
            target = "huddle::orchestrator",
            participant = %self.local,
            peers = report.peers_removed,
            close_failures = report.close_failures,
            render_failures = report.render_failures,
            "room connections torn down"
        );
        report
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        if event.participant() == Some(&self.local) {
            debug!(target = "huddle::orchestrator", ?event, "ignoring event about ourselves");
            return;
        }
        match event {
            SignalingEvent::Joined(participant) => self.on_joined(participant),
            SignalingEvent::Ready(participant) => self.on_ready(participant),
            SignalingEvent::Left(participant) => {
                info!(target = "huddle::orchestrator", %participant, "participant left");
                self.forget_dial(&participant);
                self.names.remove(&participant);
                self.registry.remove(&participant);
            }
            SignalingEvent::NameChanged { participant, name } => {
                debug!(target = "huddle::orchestrator", %participant, %name, "participant renamed");
                self.registry.rename(&participant, &name);
                self.names.insert(participant, name);
            }
            SignalingEvent::Disconnected { reason } => {
                warn!(target = "huddle::orchestrator", %reason, "signaling disconnected");
                self.signaling_connected = false;
            }
        }
    }

    fn on_joined(&mut self, participant: ParticipantId) {
        if self.dials.contains_key(&participant) {
            debug!(target = "huddle::orchestrator", %participant, "duplicate join while dial pending");
            return;
        }
        let existing = self.registry.get(&participant).map(PeerEntry::is_open);
        info!(target = "huddle::orchestrator", %participant, ?existing, "participant joined");
        match (existing, self.policy) {
            (Some(true), _) => {
                debug!(target = "huddle::orchestrator", %participant, "already connected");
            }
            // The participant announced readiness before, so a dead entry is
            // redialled straight away.
            (Some(false), DialPolicy::ReadyHandshake) => self.start_dial(participant),
            (None, DialPolicy::ReadyHandshake) => {
                let attempt = self.allocate_attempt();
                self.dials.insert(
                    participant,
                    PendingDial {
                        attempt,
                        stage: DialStage::AwaitingReady,
                    },
                );
            }
            (_, DialPolicy::FixedDelay(delay)) => self.schedule_dial(participant, delay),
        }
    }

    fn on_ready(&mut self, participant: ParticipantId) {
        match self.dials.get(&participant).map(|dial| dial.stage) {
            Some(DialStage::InFlight) => {
                debug!(target = "huddle::orchestrator", %participant, "ready while dial in flight");
            }
            Some(DialStage::AwaitingReady | DialStage::Scheduled) => self.start_dial(participant),
            None if self.registry.contains(&participant) => {
                debug!(target = "huddle::orchestrator", %participant, "ready from connected participant");
            }
            None => {
                debug!(target = "huddle::orchestrator", %participant, "ready without join; dialling");
                self.start_dial(participant);
            }
        }
    }

    fn schedule_dial(&mut self, participant: ParticipantId, delay: Duration) {
        let attempt = self.allocate_attempt();
        self.dials.insert(
            participant.clone(),
            PendingDial {
                attempt,
                stage: DialStage::Scheduled,
            },
        );
        debug!(
            target = "huddle::orchestrator",
            %participant,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "dial scheduled"
        );
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(OrchestratorEvent::DialDue {
                participant,
                attempt,
            });
        });
    }

    fn start_dial(&mut self, participant: ParticipantId) {
        let Some(stream) = self.media.stream().cloned() else {
            warn!(target = "huddle::orchestrator", %participant, "no local stream to offer; not dialling");
            self.dials.remove(&participant);
            return;
        };
        let attempt = self.allocate_attempt();
        self.dials.insert(
            participant.clone(),
            PendingDial {
                attempt,
                stage: DialStage::InFlight,
            },
        );
        info!(target = "huddle::orchestrator", %participant, attempt, "dialling participant");
        telemetry::record_count("calls_placed");

        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.call(&participant, &stream).await;
            let _ = tx.send(OrchestratorEvent::DialResolved {
                participant,
                attempt,
                result,
            });
        });
    }

    fn on_dial_due(&mut self, participant: ParticipantId, attempt: u64) {
        match self.dials.get(&participant) {
            Some(dial) if dial.attempt == attempt && dial.stage == DialStage::Scheduled => {
                self.start_dial(participant)
            }
            _ => debug!(target = "huddle::orchestrator", %participant, attempt, "stale dial timer"),
        }
    }

    fn on_dial_resolved(
        &mut self,
        participant: ParticipantId,
        attempt: u64,
        result: Result<Box<dyn MediaConnection>, ConnectionError>,
    ) {
        let current = matches!(
            self.dials.get(&participant),
            Some(dial) if dial.attempt == attempt && dial.stage == DialStage::InFlight
        );
        if current {
            self.dials.remove(&participant);
        }

        match result {
            Ok(connection) if current => {
                let connection_id = connection.id();
                self.registry
                    .upsert(participant.clone(), connection, CallDirection::Outgoing);
                self.apply_known_name(&participant);
                if let Some((owner, stream)) = self.early_streams.remove(&connection_id) {
                    if owner == participant {
                        self.bind_stream(&participant, connection_id, stream);
                    }
                }
            }
            Ok(connection) => {
                debug!(
                    target = "huddle::orchestrator",
                    %participant,
                    attempt,
                    connection = %connection.id(),
                    "discarding stale dial result"
                );
                self.early_streams.remove(&connection.id());
                if let Err(err) = connection.close() {
                    warn!(target = "huddle::orchestrator", %participant, error = %err, "failed to close stale connection");
                }
            }
            Err(err) => {
                warn!(
                    target = "huddle::orchestrator",
                    %participant,
                    attempt,
                    error = %err,
                    "dial failed"
                );
                telemetry::record_count("calls_failed");
                if current {
                    self.early_streams.retain(|_, (owner, _)| owner != &participant);
                }
            }
        }
    }

    fn on_connector(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Incoming(call) => self.on_incoming(call),
            ConnectorEvent::Stream {
                connection_id,
                remote,
                stream,
            } => {
                let backed = self
                    .registry
                    .get(&remote)
                    .is_some_and(|entry| entry.connection_id() == connection_id);
                let dialling = matches!(
                    self.dials.get(&remote),
                    Some(dial) if dial.stage == DialStage::InFlight
                );
                if !backed && dialling {
                    debug!(
                        target = "huddle::orchestrator",
                        participant = %remote,
                        connection = %connection_id,
                        "stream arrived before dial result; holding"
                    );
                    self.early_streams.insert(connection_id, (remote, stream));
                } else {
                    self.bind_stream(&remote, connection_id, stream);
                }
            }
            ConnectorEvent::Closed {
                connection_id,
                remote,
            } => {
                self.early_streams.remove(&connection_id);
                if self.registry.remove_connection(&remote, connection_id) {
                    info!(target = "huddle::orchestrator", participant = %remote, connection = %connection_id, "connection closed");
                }
            }
            ConnectorEvent::Failed {
                connection_id,
                remote,
                error,
            } => {
                warn!(
                    target = "huddle::orchestrator",
                    participant = %remote,
                    connection = %connection_id,
                    error = %error,
                    "connection failed"
                );
                self.early_streams.remove(&connection_id);
                self.registry.remove_connection(&remote, connection_id);
            }
        }
    }

    fn on_incoming(&mut self, call: IncomingCall) {
        if call.remote == self.local {
            debug!(
                target = "huddle::orchestrator",
                connection = %call.connection_id,
                "ignoring call from ourselves"
            );
            return;
        }
        if self.keeps_own_call(&call.remote) {
            debug!(
                target = "huddle::orchestrator",
                participant = %call.remote,
                connection = %call.connection_id,
                "both sides dialled; keeping our call"
            );
            telemetry::record_count("calls_glare_ignored");
            return;
        }
        let Some(stream) = self.media.stream().cloned() else {
            warn!(target = "huddle::orchestrator", participant = %call.remote, "no local stream to answer with");
            return;
        };
        if self.forget_dial(&call.remote) {
            debug!(target = "huddle::orchestrator", participant = %call.remote, "incoming call supersedes pending dial");
        }
        match self.connector.answer(&call, &stream) {
            Ok(connection) => {
                info!(
                    target = "huddle::orchestrator",
                    participant = %call.remote,
                    connection = %call.connection_id,
                    "answered incoming call"
                );
                telemetry::record_count("calls_answered");
                self.registry
                    .upsert(call.remote.clone(), connection, CallDirection::Incoming);
                self.apply_known_name(&call.remote);
            }
            Err(err) => {
                warn!(
                    target = "huddle::orchestrator",
                    participant = %call.remote,
                    error = %err,
                    "failed to answer call"
                );
            }
        }
    }

    fn bind_stream(&mut self, participant: &ParticipantId, connection_id: ConnectionId, stream: MediaStream) {
        if let Some(binding) = self.registry.bind_remote_stream(participant, connection_id, stream) {
            self.registry.view().attach(&binding.target, &binding.stream);
        }
    }

    /// When both sides call each other, the lower id keeps its outgoing call
    /// and the other side answers it.
    fn keeps_own_call(&self, remote: &ParticipantId) -> bool {
        if self.local >= *remote {
            return false;
        }
        let dialling = matches!(
            self.dials.get(remote),
            Some(dial) if dial.stage == DialStage::InFlight
        );
        let outgoing = self.registry.get(remote).is_some_and(|entry| {
            entry.direction() == CallDirection::Outgoing && entry.is_open()
        });
        dialling || outgoing
    }

    fn apply_known_name(&mut self, participant: &ParticipantId) {
        if let Some(name) = self.names.get(participant) {
            self.registry.rename(participant, name);
        }
    }

    fn forget_dial(&mut self, participant: &ParticipantId) -> bool {
        self.early_streams.retain(|_, (owner, _)| owner != participant);
        self.dials.remove(participant).is_some()
    }

    fn allocate_attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }
}

impl fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("local", &self.local)
            .field("policy", &self.policy)
            .field("peers", &self.registry.len())
            .field("pending_dials", &self.dials.len())
            .field("closed", &self.closed)
            .finish()
    }
}
