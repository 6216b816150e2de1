//! JSON frames exchanged with the signaling server. The in-process hub
//! reuses [`ServerMessage`] as its payload format.

use serde::{Deserialize, Serialize};

use super::SignalingEvent;
use crate::ids::{ParticipantId, RoomId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    NameChange {
        room_id: RoomId,
        participant_id: ParticipantId,
        name: String,
    },
    Ready {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RoomJoined {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    UserConnected {
        participant_id: ParticipantId,
    },
    UserDisconnected {
        participant_id: ParticipantId,
    },
    NameChange {
        room_id: RoomId,
        participant_id: ParticipantId,
        name: String,
    },
    Ready {
        participant_id: ParticipantId,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Room event carried by this message, unless it is about `local` or is
    /// channel bookkeeping.
    pub fn into_event(self, local: Option<&ParticipantId>) -> Option<SignalingEvent> {
        let event = match self {
            ServerMessage::UserConnected { participant_id } => SignalingEvent::Joined(participant_id),
            ServerMessage::UserDisconnected { participant_id } => {
                SignalingEvent::Left(participant_id)
            }
            ServerMessage::NameChange {
                participant_id,
                name,
                ..
            } => SignalingEvent::NameChanged {
                participant: participant_id,
                name,
            },
            ServerMessage::Ready { participant_id } => SignalingEvent::Ready(participant_id),
            ServerMessage::RoomJoined { .. } | ServerMessage::Pong | ServerMessage::Error { .. } => {
                return None;
            }
        };
        match (event.participant(), local) {
            (Some(subject), Some(local)) if subject == local => None,
            _ => Some(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_kebab_case_type_tags() {
        let join = ClientMessage::JoinRoom {
            room_id: RoomId::new("abc123").unwrap(),
            participant_id: ParticipantId::new("abc123-1-zzzzzz").unwrap(),
        };
        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["room_id"], "abc123");

        let parsed: ServerMessage =
            serde_json::from_str(r#"{"type":"user-disconnected","participant_id":"abc123-2-yyyyyy"}"#)
                .unwrap();
        assert_eq!(
            parsed.into_event(None),
            Some(SignalingEvent::Left(
                ParticipantId::new("abc123-2-yyyyyy").unwrap()
            ))
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
    }

    #[test]
    fn events_about_the_local_participant_are_dropped() {
        let me = ParticipantId::new("abc123-1-me0000").unwrap();
        let ready = ServerMessage::Ready {
            participant_id: me.clone(),
        };
        assert_eq!(ready.into_event(Some(&me)), None);
        assert_eq!(ServerMessage::Pong.into_event(Some(&me)), None);
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"ready","participant_id":""}"#).is_err());
    }
}
