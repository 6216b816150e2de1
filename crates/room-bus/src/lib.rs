//! Topic broadcast with per-topic membership.
//!
//! Every topic is a room: members join and leave it by name, and only
//! members may publish. Subscribers see every message published on the
//! topic, including their own, and filter on [`BusMessage::sender`].

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub sender: String,
    pub payload: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("{member} is not a member of {topic}")]
    NotMember { topic: String, member: String },
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    /// Returns how many subscribers the message reached.
    fn publish(&self, topic: &str, sender: &str, payload: Bytes) -> BusResult<usize>;
}

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<BusMessage>,
    members: BTreeSet<String>,
}

impl Topic {
    fn is_abandoned(&self) -> bool {
        self.members.is_empty() && self.sender.receiver_count() == 0
    }
}

/// Receivers are dropped asynchronously (an aborted task lets go of its
/// subscription later), so every mutation sweeps topics abandoned since.
fn prune(topics: &mut HashMap<String, Topic>) {
    topics.retain(|_, topic| !topic.is_abandoned());
}

#[derive(Debug)]
pub struct RoomBus {
    topics: parking_lot::RwLock<HashMap<String, Topic>>,
    capacity: usize,
}

impl Default for RoomBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RoomBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Adds `member` to `topic`. Returns `false` when it was already a member.
    pub fn join(&self, topic: &str, member: &str) -> bool {
        let mut guard = self.topics.write();
        prune(&mut guard);
        let capacity = self.capacity;
        guard
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                sender: broadcast::channel(capacity).0,
                members: BTreeSet::new(),
            })
            .members
            .insert(member.to_string())
    }

    /// Removes `member` from `topic`. The topic itself is dropped once it has
    /// neither members nor subscribers.
    pub fn leave(&self, topic: &str, member: &str) -> bool {
        let mut guard = self.topics.write();
        let removed = guard
            .get_mut(topic)
            .is_some_and(|entry| entry.members.remove(member));
        prune(&mut guard);
        removed
    }

    pub fn is_member(&self, topic: &str, member: &str) -> bool {
        self.topics
            .read()
            .get(topic)
            .is_some_and(|entry| entry.members.contains(member))
    }

    pub fn members(&self, topic: &str) -> Vec<String> {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Bus for RoomBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut guard = self.topics.write();
        prune(&mut guard);
        let capacity = self.capacity;
        guard
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                sender: broadcast::channel(capacity).0,
                members: BTreeSet::new(),
            })
            .sender
            .subscribe()
    }

    fn publish(&self, topic: &str, sender: &str, payload: Bytes) -> BusResult<usize> {
        let guard = self.topics.read();
        let entry = guard
            .get(topic)
            .filter(|entry| entry.members.contains(sender))
            .ok_or_else(|| BusError::NotMember {
                topic: topic.to_string(),
                member: sender.to_string(),
            })?;
        // A send only fails when nobody is subscribed, which is not an error
        // for a room that has a single participant.
        Ok(entry
            .sender
            .send(BusMessage {
                topic: topic.to_string(),
                sender: sender.to_string(),
                payload,
            })
            .unwrap_or(0))
    }
}
