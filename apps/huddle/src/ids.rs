//! Identifiers for rooms, participants and pairwise connections.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;

/// Six random base-36 characters.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier {0:?} must not contain whitespace or '/'")]
    InvalidCharacter(String),
}

fn validate(raw: &str) -> Result<String, IdError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdError::Empty);
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(IdError::InvalidCharacter(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Name of a room. Immutable for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        validate(raw.as_ref()).map(Self)
    }

    pub fn generate() -> Self {
        Self(random_suffix())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of one participant for one room entry. A fresh one is generated
/// on every entry, so ids are never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        validate(raw.as_ref()).map(Self)
    }

    /// `{room}-{unix millis}-{random suffix}`.
    pub fn generate(room: &RoomId) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        Self(format!("{}-{}-{}", room, millis, random_suffix()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `-` separated segment; the random suffix for generated ids.
    pub fn short_tag(&self) -> &str {
        self.0.rsplit('-').next().unwrap_or(self.0.as_str())
    }

    pub fn default_label(&self) -> String {
        format!("User {}", self.short_tag())
    }
}

/// Allocated by the connector for every pairwise connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl FromStr for RoomId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl FromStr for ParticipantId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl From<ParticipantId> for String {
    fn from(value: ParticipantId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_participant_ids_are_scoped_to_the_room() {
        let room = RoomId::new("standup").unwrap();
        let first = ParticipantId::generate(&room);
        let second = ParticipantId::generate(&room);

        assert_ne!(first, second);
        let parts: Vec<&str> = first.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "standup");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(first.short_tag(), parts[2]);
        assert_eq!(first.short_tag().len(), 6);
        assert_eq!(first.default_label(), format!("User {}", parts[2]));
    }

    #[test]
    fn room_ids_are_trimmed_and_validated() {
        assert_eq!(RoomId::new("  abc123 ").unwrap().as_str(), "abc123");
        assert_eq!(RoomId::new("   "), Err(IdError::Empty));
        assert!(matches!(
            RoomId::new("a/b"),
            Err(IdError::InvalidCharacter(_))
        ));

        let generated = RoomId::generate();
        assert_eq!(generated.as_str().len(), 6);
        assert!(
            generated
                .as_str()
                .bytes()
                .all(|b| SUFFIX_ALPHABET.contains(&b))
        );
    }

    #[test]
    fn wire_ids_reject_empty_strings() {
        let parsed: ParticipantId = serde_json::from_str("\"room-1-abcdef\"").unwrap();
        assert_eq!(parsed.short_tag(), "abcdef");
        assert!(serde_json::from_str::<ParticipantId>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"room-1-abcdef\"");
    }

    #[test]
    fn short_tag_of_undashed_id_is_the_whole_id() {
        let id = ParticipantId::new("solo").unwrap();
        assert_eq!(id.short_tag(), "solo");
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }
}
