//! Typed envelopes exchanged with connected participants.
//!
//! Every frame on the wire is a JSON object `{kind, payload, timestamp}`.
//! Outbound frames are built from [`ServerEvent`]; inbound frames decode into
//! [`InboundMessage`], with unrecognised kinds preserved as
//! [`InboundMessage::Unknown`] rather than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::consensus::{Choice, SessionProgress};
use crate::error::{ConnectionError, ConnectionResult};
use crate::storage::Criterion;

/// Identity of one live connection.
pub type AgentId = Uuid;

/// Inbound kind names.
pub mod kinds {
    pub const JOIN_SESSION: &str = "join-session";
    pub const LEAVE_SESSION: &str = "leave-session";
    pub const VOTE_SUBMITTED: &str = "vote-submitted";
    pub const SCORE_SUBMITTED: &str = "score-submitted";
    pub const PONG: &str = "pong";
}

/// Error code for undecodable frames.
pub const CODE_MALFORMED: u16 = 4000;
/// Error code for well-formed frames of an unrecognised kind.
pub const CODE_UNKNOWN_KIND: u16 = 4001;
/// Error code for session-scoped messages sent before `join-session`.
pub const CODE_NOT_JOINED: u16 = 4003;

/// Events pushed from the server to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent to a participant right after it joins a session.
    Welcome(WelcomePayload),
    /// A vote was recorded on a still-open comparison.
    VoteUpdate(VoteUpdatePayload),
    /// A comparison closed.
    ConsensusReached(ConsensusReachedPayload),
    /// Completed/total comparisons changed.
    SessionProgress(SessionProgress),
    /// A magnitude score was recorded. The value itself is not disclosed.
    ScoreSubmitted(ScoreSubmittedPayload),
    /// An item's magnitude was locked.
    ConsensusLocked(ConsensusLockedPayload),
    /// An item's magnitude lock was removed.
    ConsensusUnlocked(ConsensusUnlockedPayload),
    /// Every comparison of the session closed.
    SessionCompleted(SessionCompletedPayload),
    /// A participant connected to or left the session.
    AttendeeStatus(AttendeeStatusPayload),
    /// A request from this connection was rejected.
    Error(ErrorPayload),
    /// Liveness probe; answered with `pong`.
    Ping,
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Welcome(_) => "welcome",
            ServerEvent::VoteUpdate(_) => "vote-update",
            ServerEvent::ConsensusReached(_) => "consensus-reached",
            ServerEvent::SessionProgress(_) => "session-progress",
            ServerEvent::ScoreSubmitted(_) => "score-submitted",
            ServerEvent::ConsensusLocked(_) => "consensus-locked",
            ServerEvent::ConsensusUnlocked(_) => "consensus-unlocked",
            ServerEvent::SessionCompleted(_) => "session-completed",
            ServerEvent::AttendeeStatus(_) => "attendee-status",
            ServerEvent::Error(_) => "error",
            ServerEvent::Ping => "ping",
        }
    }

    /// Build an `error` event.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub agent_id: AgentId,
    pub session_id: String,
    pub participant_id: i64,
    pub criterion: Criterion,
    pub progress: SessionProgress,
    /// Participants currently connected to the session, the joiner included.
    pub online: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteUpdatePayload {
    pub session_id: String,
    pub comparison_id: String,
    pub participant_id: i64,
    pub votes_cast: usize,
    pub votes_expected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReachedPayload {
    pub session_id: String,
    pub comparison_id: String,
    pub winner_id: Option<i64>,
    pub is_tie: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSubmittedPayload {
    pub item_id: i64,
    pub criterion: Criterion,
    pub participant_id: i64,
    pub scores_submitted: usize,
    pub scores_expected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusLockedPayload {
    pub item_id: i64,
    pub criterion: Criterion,
    pub value: i64,
    pub locked_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusUnlockedPayload {
    pub item_id: i64,
    pub criterion: Criterion,
    pub unlocked_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletedPayload {
    pub session_id: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendeeStatusPayload {
    pub session_id: String,
    pub participant_id: i64,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// An outbound frame: an event stamped with its send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to a single JSON frame.
    pub fn to_frame(&self) -> ConnectionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<ServerEvent> for Envelope {
    fn from(event: ServerEvent) -> Self {
        Envelope::new(event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSessionPayload {
    pub session_id: String,
    pub participant_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSubmittedPayload {
    pub comparison_id: String,
    pub choice: Choice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSubmittedRequest {
    pub item_id: i64,
    pub criterion: Criterion,
    pub value: i64,
}

/// Messages a participant may send.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    JoinSession(JoinSessionPayload),
    LeaveSession,
    VoteSubmitted(VoteSubmittedPayload),
    ScoreSubmitted(ScoreSubmittedRequest),
    Pong,
    /// A well-formed envelope of a kind this server does not handle.
    Unknown { kind: String, raw: Vec<u8> },
}

#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
    #[serde(default)]
    payload: Value,
    #[allow(dead_code)]
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> ConnectionResult<T> {
    serde_json::from_value(value).map_err(|e| ConnectionError::InvalidPayload {
        kind: kind.to_string(),
        message: e.to_string(),
    })
}

impl InboundMessage {
    /// Decode one frame.
    ///
    /// Returns [`ConnectionError::Protocol`] when the frame is not an envelope
    /// at all and [`ConnectionError::InvalidPayload`] when a known kind
    /// carries a payload of the wrong shape.
    pub fn decode(frame: &[u8]) -> ConnectionResult<Self> {
        let raw: RawEnvelope =
            serde_json::from_slice(frame).map_err(|e| ConnectionError::Protocol {
                message: format!("malformed envelope: {}", e),
            })?;

        let message = match raw.kind.as_str() {
            kinds::JOIN_SESSION => InboundMessage::JoinSession(payload(&raw.kind, raw.payload)?),
            kinds::LEAVE_SESSION => InboundMessage::LeaveSession,
            kinds::VOTE_SUBMITTED => InboundMessage::VoteSubmitted(payload(&raw.kind, raw.payload)?),
            kinds::SCORE_SUBMITTED => {
                InboundMessage::ScoreSubmitted(payload(&raw.kind, raw.payload)?)
            }
            kinds::PONG => InboundMessage::Pong,
            _ => InboundMessage::Unknown {
                kind: raw.kind,
                raw: frame.to_vec(),
            },
        };

        Ok(message)
    }

    /// Wire name of the message.
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::JoinSession(_) => kinds::JOIN_SESSION,
            InboundMessage::LeaveSession => kinds::LEAVE_SESSION,
            InboundMessage::VoteSubmitted(_) => kinds::VOTE_SUBMITTED,
            InboundMessage::ScoreSubmitted(_) => kinds::SCORE_SUBMITTED,
            InboundMessage::Pong => kinds::PONG,
            InboundMessage::Unknown { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(ServerEvent::ConsensusReached(ConsensusReachedPayload {
            session_id: "s1".to_string(),
            comparison_id: "c1".to_string(),
            winner_id: Some(4),
            is_tie: false,
        }));
        let value: Value = serde_json::from_slice(&envelope.to_frame().unwrap()).unwrap();

        assert_eq!(value["kind"], "consensus-reached");
        assert_eq!(
            value["payload"],
            json!({"session_id": "s1", "comparison_id": "c1", "winner_id": 4, "is_tie": false})
        );
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            ServerEvent::Ping,
            ServerEvent::error(4001, "nope"),
            ServerEvent::SessionProgress(SessionProgress {
                session_id: "s".to_string(),
                completed: 1,
                total: 3,
            }),
            ServerEvent::ConsensusUnlocked(ConsensusUnlockedPayload {
                item_id: 1,
                criterion: Criterion::Value,
                unlocked_by: None,
            }),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["kind"], event.kind());
        }
    }

    #[test]
    fn test_decode_join() {
        let frame = br#"{"kind":"join-session","payload":{"session_id":"abc","participant_id":7},"timestamp":"2024-05-01T10:00:00Z"}"#;
        let message = InboundMessage::decode(frame).unwrap();
        assert_eq!(
            message,
            InboundMessage::JoinSession(JoinSessionPayload {
                session_id: "abc".to_string(),
                participant_id: 7,
            })
        );
    }

    #[test]
    fn test_decode_vote_with_choice() {
        let frame = br#"{"kind":"vote-submitted","payload":{"comparison_id":"c","choice":{"type":"prefer","item_id":3}}}"#;
        let message = InboundMessage::decode(frame).unwrap();
        assert_eq!(
            message,
            InboundMessage::VoteSubmitted(VoteSubmittedPayload {
                comparison_id: "c".to_string(),
                choice: Choice::Prefer { item_id: 3 },
            })
        );

        let tie = br#"{"kind":"vote-submitted","payload":{"comparison_id":"c","choice":{"type":"tie"}}}"#;
        assert!(matches!(
            InboundMessage::decode(tie).unwrap(),
            InboundMessage::VoteSubmitted(VoteSubmittedPayload { choice: Choice::Tie, .. })
        ));
    }

    #[test]
    fn test_decode_payloadless_kinds() {
        assert_eq!(
            InboundMessage::decode(br#"{"kind":"pong"}"#).unwrap(),
            InboundMessage::Pong
        );
        assert_eq!(
            InboundMessage::decode(br#"{"kind":"leave-session","payload":null}"#).unwrap(),
            InboundMessage::LeaveSession
        );
    }

    #[test]
    fn test_unknown_kind_keeps_raw_bytes() {
        let frame = br#"{"kind":"dance","payload":{"style":"waltz"}}"#;
        match InboundMessage::decode(frame).unwrap() {
            InboundMessage::Unknown { kind, raw } => {
                assert_eq!(kind, "dance");
                assert_eq!(raw, frame.to_vec());
            }
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = InboundMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol { .. }));

        let err = InboundMessage::decode(br#"{"payload":{}}"#).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol { .. }));
    }

    #[test]
    fn test_bad_payload_is_invalid_payload() {
        let frame = br#"{"kind":"score-submitted","payload":{"item_id":"x"}}"#;
        let err = InboundMessage::decode(frame).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidPayload { ref kind, .. } if kind == "score-submitted"));
        assert_eq!(err.code(), 4002);
    }
}
