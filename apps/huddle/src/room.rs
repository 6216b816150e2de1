//! Room entry, the per-room event loop and the handle handed to the
//! presentation layer.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, JoinPolicy};
use crate::error::{RoomError, SignalingError};
use crate::ids::{ParticipantId, RoomId};
use crate::media::{LocalMediaSession, MediaConstraints, MediaDevices};
use crate::orchestrator::{ConnectionOrchestrator, OrchestratorEvent};
use crate::peer::{ConnectorEvent, MediaConnector};
use crate::registry::{PeerConnectionRegistry, PeerSummary, TeardownReport};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::view::{RenderSurface, RenderTarget, ViewBinder};

/// The external services a room talks to.
#[derive(Clone)]
pub struct RoomCollaborators {
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingClient>,
    pub connector: Arc<dyn MediaConnector>,
    pub surface: Arc<dyn RenderSurface>,
}

/// Everything a presentation layer needs to draw the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub room: RoomId,
    pub local: ParticipantId,
    pub display_name: String,
    pub muted: bool,
    pub video_off: bool,
    pub signaling_connected: bool,
    pub peers: Vec<PeerSummary>,
    pub ended: bool,
}

impl RoomSnapshot {
    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|peer| peer.has_stream).count()
    }
}

enum RoomCommand {
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<bool>),
    Rename {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Leave(Option<oneshot::Sender<TeardownReport>>),
}

struct RoomChannels {
    internal: mpsc::UnboundedReceiver<OrchestratorEvent>,
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    connector: mpsc::UnboundedReceiver<ConnectorEvent>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
}

/// State owned by the room task.
pub struct RoomSession {
    room: RoomId,
    local: ParticipantId,
    signaling: Arc<dyn SignalingClient>,
    connector: Arc<dyn MediaConnector>,
    view: ViewBinder,
    preview: Option<RenderTarget>,
    orchestrator: ConnectionOrchestrator,
    ended: bool,
}

impl RoomSession {
    /// Acquires local media, joins `room` and starts the room task.
    ///
    /// Media failures abort before anything is sent to signaling. Signaling
    /// failures abort with local media released.
    pub async fn enter(
        config: Config,
        room: RoomId,
        collaborators: RoomCollaborators,
    ) -> Result<RoomHandle, RoomError> {
        config.validate()?;
        let RoomCollaborators {
            devices,
            signaling,
            connector,
            surface,
        } = collaborators;

        let mut media =
            LocalMediaSession::acquire(devices.as_ref(), MediaConstraints::default()).await?;
        let local = ParticipantId::generate(&room);
        info!(target = "huddle::room", %room, participant = %local, "entering room");

        let view = ViewBinder::new(surface);
        let preview = view.create_target(None, media.display_name());
        if let (Some(target), Some(stream)) = (&preview, media.stream()) {
            view.attach_preview(target, stream);
        }

        let setup = async {
            let connector_events = connector.open(&local, &config.rendezvous).await?;
            let signaling_events = signaling.events().await?;
            join_room(signaling.as_ref(), &room, &local, config.join).await?;
            Ok::<_, RoomError>((connector_events, signaling_events))
        }
        .await;
        let (connector_events, signaling_events) = match setup {
            Ok(events) => events,
            Err(err) => {
                warn!(target = "huddle::room", %room, participant = %local, error = %err, "room entry failed");
                signaling.disconnect().await;
                connector.shutdown().await;
                media.release();
                if let Some(target) = &preview {
                    let _ = view.detach(target);
                }
                return Err(err);
            }
        };

        let registry = PeerConnectionRegistry::new(view.clone());
        let (orchestrator, internal) = ConnectionOrchestrator::new(
            local.clone(),
            config.dial_policy,
            media,
            registry,
            Arc::clone(&connector),
        );
        if config.dial_policy.announces_ready() {
            if let Err(err) = signaling.emit_ready(&room, &local).await {
                warn!(target = "huddle::room", %room, error = %err, "failed to announce readiness");
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = RoomSession {
            room: room.clone(),
            local: local.clone(),
            signaling,
            connector,
            view,
            preview,
            orchestrator,
            ended: false,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let channels = RoomChannels {
            internal,
            signaling: signaling_events,
            connector: connector_events,
            commands: commands_rx,
        };
        let task = tokio::spawn(session.run(channels, snapshot_tx));

        info!(
            target = "huddle::room",
            %room,
            participant = %local,
            policy = %config.dial_policy,
            "room joined"
        );
        Ok(RoomHandle {
            share_link: config.share_link(&room),
            room,
            local,
            commands: commands_tx,
            snapshot: snapshot_rx,
            task: Some(task),
        })
    }

    async fn run(mut self, mut channels: RoomChannels, snapshot: watch::Sender<RoomSnapshot>) {
        let mut signaling_open = true;
        let mut connector_open = true;
        loop {
            tokio::select! {
                Some(event) = channels.internal.recv() => self.orchestrator.handle(event),
                event = channels.signaling.recv(), if signaling_open => match event {
                    Some(event) => self.orchestrator.handle(OrchestratorEvent::Signaling(event)),
                    None => {
                        signaling_open = false;
                        self.orchestrator.handle(OrchestratorEvent::Signaling(
                            SignalingEvent::Disconnected {
                                reason: "signaling event stream ended".into(),
                            },
                        ));
                    }
                },
                event = channels.connector.recv(), if connector_open => match event {
                    Some(event) => self.orchestrator.handle(OrchestratorEvent::Connector(event)),
                    None => {
                        connector_open = false;
                        warn!(target = "huddle::room", room = %self.room, "connector event stream ended");
                    }
                },
                command = channels.commands.recv() => match command {
                    Some(RoomCommand::Leave(reply)) => {
                        let report = self.leave().await;
                        self.publish(&snapshot);
                        if let Some(reply) = reply {
                            let _ = reply.send(report);
                        }
                        break;
                    }
                    Some(command) => self.apply(command).await,
                    None => {
                        debug!(target = "huddle::room", room = %self.room, "room handle gone; leaving");
                        self.leave().await;
                        self.publish(&snapshot);
                        break;
                    }
                },
            }
            self.publish(&snapshot);
        }
    }

    async fn apply(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::ToggleAudio(reply) => {
                let muted = self.orchestrator.media_mut().toggle_audio();
                info!(target = "huddle::room", participant = %self.local, muted, "audio toggled");
                let _ = reply.send(muted);
            }
            RoomCommand::ToggleVideo(reply) => {
                let video_off = self.orchestrator.media_mut().toggle_video();
                info!(target = "huddle::room", participant = %self.local, video_off, "video toggled");
                let _ = reply.send(video_off);
            }
            RoomCommand::Rename { name, reply } => {
                let changed = self.orchestrator.media_mut().rename(&name);
                if changed {
                    let name = self.orchestrator.media().display_name().to_string();
                    if let Some(target) = &self.preview {
                        self.view.relabel(target, &name);
                    }
                    if let Err(err) = self
                        .signaling
                        .emit_name_changed(&self.room, &self.local, &name)
                        .await
                    {
                        warn!(target = "huddle::room", error = %err, "failed to publish display name");
                    }
                }
                let _ = reply.send(changed);
            }
            RoomCommand::Leave(_) => {}
        }
    }

    async fn leave(&mut self) -> TeardownReport {
        let mut report = self.orchestrator.shutdown();
        if let Some(target) = self.preview.take() {
            if self.view.detach(&target).is_err() {
                report.render_failures += 1;
            }
        }
        self.signaling.disconnect().await;
        report.signaling_disconnected = true;
        self.connector.shutdown().await;
        self.ended = true;
        info!(
            target = "huddle::room",
            room = %self.room,
            participant = %self.local,
            peers = report.peers_removed,
            tracks = report.media_tracks_stopped,
            "left room"
        );
        report
    }

    fn snapshot(&self) -> RoomSnapshot {
        let media = self.orchestrator.media();
        RoomSnapshot {
            room: self.room.clone(),
            local: self.local.clone(),
            display_name: media.display_name().to_string(),
            muted: media.is_muted(),
            video_off: media.is_video_off(),
            signaling_connected: self.orchestrator.signaling_connected(),
            peers: self.orchestrator.peers(),
            ended: self.ended,
        }
    }

    fn publish(&self, snapshot: &watch::Sender<RoomSnapshot>) {
        snapshot.send_if_modified(|current| {
            let next = self.snapshot();
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Connects and announces, retrying with a doubling backoff. An attempt
/// that does not complete within `policy.timeout` counts as failed.
async fn join_room(
    signaling: &dyn SignalingClient,
    room: &RoomId,
    local: &ParticipantId,
    policy: JoinPolicy,
) -> Result<(), SignalingError> {
    let mut backoff = policy.retry_backoff;
    let mut last_error = None;
    for attempt in 1..=policy.attempts {
        let join = async {
            signaling.connect(room).await?;
            signaling.announce(room, local).await
        };
        match tokio::time::timeout(policy.timeout, join).await {
            Ok(Ok(())) => {
                debug!(target = "huddle::room", %room, attempt, "presence confirmed");
                return Ok(());
            }
            Ok(Err(err)) => {
                warn!(target = "huddle::room", %room, attempt, error = %err, "join attempt failed");
                last_error = Some(err);
            }
            Err(_) => {
                warn!(
                    target = "huddle::room",
                    %room,
                    attempt,
                    timeout_ms = policy.timeout.as_millis() as u64,
                    "join attempt timed out"
                );
                last_error = None;
            }
        }
        signaling.disconnect().await;
        if attempt < policy.attempts {
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }
    Err(last_error.unwrap_or(SignalingError::JoinTimeout {
        attempts: policy.attempts,
    }))
}

/// Handle to a running room. Dropping it leaves the room in the background.
pub struct RoomHandle {
    room: RoomId,
    local: ParticipantId,
    share_link: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshot: watch::Receiver<RoomSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl RoomHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn share_link(&self) -> &str {
        &self.share_link
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.clone()
    }

    /// Returns whether audio is now muted.
    pub async fn toggle_audio(&self) -> Result<bool, RoomError> {
        self.request(RoomCommand::ToggleAudio).await
    }

    /// Returns whether video is now off.
    pub async fn toggle_video(&self) -> Result<bool, RoomError> {
        self.request(RoomCommand::ToggleVideo).await
    }

    /// Changes the display name and tells the room. Returns `false` for blank
    /// or unchanged names.
    pub async fn rename(&self, name: impl Into<String>) -> Result<bool, RoomError> {
        let name = name.into();
        self.request(|reply| RoomCommand::Rename { name, reply })
            .await
    }

    pub async fn leave(mut self) -> Result<TeardownReport, RoomError> {
        let report = self.request(|reply| RoomCommand::Leave(Some(reply))).await?;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(target = "huddle::room", room = %self.room, error = %err, "room task ended abnormally");
            }
        }
        Ok(report)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| RoomError::Closed)?;
        response.await.map_err(|_| RoomError::Closed)
    }
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room", &self.room)
            .field("participant", &self.local)
            .finish_non_exhaustive()
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(RoomCommand::Leave(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FlakySignaling {
        failures_left: Mutex<u32>,
        attempts: Mutex<Vec<tokio::time::Instant>>,
        disconnects: Mutex<u32>,
    }

    #[async_trait]
    impl SignalingClient for FlakySignaling {
        async fn connect(&self, _room: &RoomId) -> Result<(), SignalingError> {
            Ok(())
        }

        async fn announce(
            &self,
            _room: &RoomId,
            _participant: &ParticipantId,
        ) -> Result<(), SignalingError> {
            self.attempts.lock().push(tokio::time::Instant::now());
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SignalingError::Server("room is warming up".into()));
            }
            Ok(())
        }

        async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
            Err(SignalingError::EventsTaken)
        }

        async fn emit_name_changed(
            &self,
            _room: &RoomId,
            _participant: &ParticipantId,
            _name: &str,
        ) -> Result<(), SignalingError> {
            Ok(())
        }

        async fn emit_ready(
            &self,
            _room: &RoomId,
            _participant: &ParticipantId,
        ) -> Result<(), SignalingError> {
            Ok(())
        }

        async fn disconnect(&self) {
            *self.disconnects.lock() += 1;
        }
    }

    fn policy(attempts: u32) -> JoinPolicy {
        JoinPolicy {
            timeout: Duration::from_secs(1),
            attempts,
            retry_backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_with_doubling_backoff() {
        let signaling = FlakySignaling {
            failures_left: Mutex::new(2),
            ..FlakySignaling::default()
        };
        let room = RoomId::new("abc123").unwrap();
        let me = ParticipantId::generate(&room);

        join_room(&signaling, &room, &me, policy(3)).await.unwrap();

        let attempts = signaling.attempts.lock().clone();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(100));
        assert_eq!(attempts[2] - attempts[1], Duration::from_millis(200));
        assert_eq!(*signaling.disconnects.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn join_reports_the_last_error_once_attempts_run_out() {
        let signaling = FlakySignaling {
            failures_left: Mutex::new(5),
            ..FlakySignaling::default()
        };
        let room = RoomId::new("abc123").unwrap();
        let me = ParticipantId::generate(&room);

        let err = join_room(&signaling, &room, &me, policy(2)).await.unwrap_err();
        assert_eq!(err, SignalingError::Server("room is warming up".into()));
        assert_eq!(signaling.attempts.lock().len(), 2);
    }
}
