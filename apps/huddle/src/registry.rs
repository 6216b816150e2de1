//! Authoritative map from remote participant to its connection, remote
//! stream and render target.
//!
//! At most one entry exists per participant. Recording a connection for a
//! participant that already has one tears the old entry down first.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::ids::{ConnectionId, ParticipantId};
use crate::media::MediaStream;
use crate::peer::{CallDirection, MediaConnection};
use crate::telemetry;
use crate::view::{RenderTarget, ViewBinder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Known through signaling, not dialled yet.
    Idle,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
pub struct PeerEntry {
    participant: ParticipantId,
    connection: Box<dyn MediaConnection>,
    direction: CallDirection,
    state: PeerState,
    remote_stream: Option<MediaStream>,
    render_target: Option<RenderTarget>,
    display_name: Option<String>,
    created_at: i64,
}

impl PeerEntry {
    fn new(
        participant: ParticipantId,
        connection: Box<dyn MediaConnection>,
        direction: CallDirection,
        display_name: Option<String>,
    ) -> Self {
        Self {
            participant,
            connection,
            direction,
            state: PeerState::Connecting,
            remote_stream: None,
            render_target: None,
            display_name,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn render_target(&self) -> Option<&RenderTarget> {
        self.render_target.as_ref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Display name if one arrived, otherwise `User {tag}`.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.participant.default_label())
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            participant: self.participant.clone(),
            connection: self.connection.id(),
            direction: self.direction,
            state: self.state,
            label: self.label(),
            has_stream: self.remote_stream.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub participant: ParticipantId,
    pub connection: ConnectionId,
    pub direction: CallDirection,
    pub state: PeerState,
    pub label: String,
    pub has_stream: bool,
}

/// Outcome of tearing entries down. Failures are counted, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub peers_removed: usize,
    pub close_failures: usize,
    pub render_failures: usize,
    pub media_tracks_stopped: usize,
    pub signaling_disconnected: bool,
}

/// A stream that should be attached to `target` now.
#[derive(Debug, Clone)]
pub struct StreamBinding {
    pub target: RenderTarget,
    pub stream: MediaStream,
}

#[derive(Debug)]
pub struct PeerConnectionRegistry {
    entries: HashMap<ParticipantId, PeerEntry>,
    view: ViewBinder,
}

impl PeerConnectionRegistry {
    pub fn new(view: ViewBinder) -> Self {
        Self {
            entries: HashMap::new(),
            view,
        }
    }

    pub fn view(&self) -> &ViewBinder {
        &self.view
    }

    /// Records `connection` as the participant's only connection. A previous
    /// entry is torn down before the new one is stored; its display name is
    /// kept.
    pub fn upsert(
        &mut self,
        participant: ParticipantId,
        connection: Box<dyn MediaConnection>,
        direction: CallDirection,
    ) -> &PeerEntry {
        let mut display_name = None;
        if let Some(previous) = self.entries.remove(&participant) {
            display_name = previous.display_name.clone();
            if previous.connection.id() == connection.id() {
                debug!(
                    target = "huddle::registry",
                    %participant,
                    connection = %connection.id(),
                    "connection recorded twice; keeping the existing entry"
                );
                return self.entries.entry(participant).or_insert(previous);
            }
            debug!(
                target = "huddle::registry",
                %participant,
                previous = %previous.connection.id(),
                replacement = %connection.id(),
                "replacing peer connection"
            );
            let mut report = TeardownReport::default();
            self.teardown(previous, &mut report);
        }

        debug!(
            target = "huddle::registry",
            %participant,
            connection = %connection.id(),
            %direction,
            "peer recorded"
        );
        let entry = PeerEntry::new(participant.clone(), connection, direction, display_name);
        telemetry::record_gauge("peers_active", self.entries.len() as u64 + 1);
        self.entries.entry(participant).or_insert(entry)
    }

    /// Attaches a remote stream to the participant's entry if it is still
    /// backed by `connection_id`. The render target is created on the first
    /// stream. Streams for removed or replaced connections are dropped.
    pub fn bind_remote_stream(
        &mut self,
        participant: &ParticipantId,
        connection_id: ConnectionId,
        stream: MediaStream,
    ) -> Option<StreamBinding> {
        let view = &self.view;
        let Some(entry) = self.entries.get_mut(participant) else {
            debug!(
                target = "huddle::registry",
                %participant,
                connection = %connection_id,
                "stream for a participant that is gone; dropping"
            );
            return None;
        };
        if entry.connection.id() != connection_id {
            debug!(
                target = "huddle::registry",
                %participant,
                connection = %connection_id,
                current = %entry.connection.id(),
                "stream for a replaced connection; dropping"
            );
            return None;
        }

        if entry.render_target.is_none() {
            entry.render_target = view.create_target(Some(participant), &entry.label());
        }
        entry.remote_stream = Some(stream.clone());
        entry.state = PeerState::Connected;
        debug!(
            target = "huddle::registry",
            %participant,
            connection = %connection_id,
            stream = %stream.id(),
            "remote stream bound"
        );
        entry
            .render_target
            .clone()
            .map(|target| StreamBinding { target, stream })
    }

    /// Closes and forgets the participant's connection. Returns whether an
    /// entry existed.
    pub fn remove(&mut self, participant: &ParticipantId) -> bool {
        match self.entries.remove(participant) {
            Some(entry) => {
                let mut report = TeardownReport::default();
                self.teardown(entry, &mut report);
                telemetry::record_gauge("peers_active", self.entries.len() as u64);
                true
            }
            None => false,
        }
    }

    /// Like [`remove`](Self::remove), but only while the entry is still
    /// backed by `connection_id`.
    pub fn remove_connection(
        &mut self,
        participant: &ParticipantId,
        connection_id: ConnectionId,
    ) -> bool {
        let current = self.entries.get(participant).map(PeerEntry::connection_id);
        match current {
            Some(current) if current == connection_id => self.remove(participant),
            Some(current) => {
                debug!(
                    target = "huddle::registry",
                    %participant,
                    connection = %connection_id,
                    %current,
                    "ignoring close of a replaced connection"
                );
                false
            }
            None => false,
        }
    }

    pub fn remove_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut entries: Vec<PeerEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(PeerEntry::created_at);
        for entry in entries {
            self.teardown(entry, &mut report);
        }
        telemetry::record_gauge("peers_active", 0);
        report
    }

    /// Stores the display name and relabels the tile. Returns whether the
    /// participant has an entry.
    pub fn rename(&mut self, participant: &ParticipantId, name: &str) -> bool {
        let view = &self.view;
        let Some(entry) = self.entries.get_mut(participant) else {
            return false;
        };
        entry.display_name = Some(name.to_string());
        if let Some(target) = &entry.render_target {
            view.relabel(target, name);
        }
        true
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&PeerEntry> {
        self.entries.get(participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.entries.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Entries in join order.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut entries: Vec<&PeerEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.created_at, &a.participant).cmp(&(b.created_at, &b.participant))
        });
        entries.into_iter().map(PeerEntry::summary).collect()
    }

    fn teardown(&self, mut entry: PeerEntry, report: &mut TeardownReport) {
        if entry.connection.is_open() {
            if let Err(err) = entry.connection.close() {
                warn!(
                    target = "huddle::registry",
                    participant = %entry.participant,
                    connection = %entry.connection.id(),
                    error = %err,
                    "failed to close peer connection"
                );
                report.close_failures += 1;
                telemetry::record_count("teardown_close_failures");
            }
        }
        if let Some(target) = entry.render_target.take() {
            if self.view.detach(&target).is_err() {
                report.render_failures += 1;
                telemetry::record_count("teardown_render_failures");
            }
        }
        entry.state = PeerState::Closed;
        report.peers_removed += 1;
        debug!(
            target = "huddle::registry",
            participant = %entry.participant,
            connection = %entry.connection.id(),
            state = ?entry.state,
            "peer removed"
        );
    }
}
