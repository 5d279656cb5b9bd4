use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier for one streaming request/response exchange.
///
/// Allocated fresh on every send so events from a superseded exchange can be
/// told apart and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Chat speaker role as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Local lifecycle of a message; never sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    /// Placeholder receiving deltas from the given session.
    Streaming(SessionId),
    #[default]
    Done,
    /// The session feeding this placeholder was cancelled.
    Cancelled,
    /// Controller-authored report of a failed session.
    Failed,
}

/// Message metadata: known keys plus an open side map for anything else.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggest: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMeta {
    pub fn is_empty(&self) -> bool {
        self.channel.is_none() && self.suggest.is_none() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "MessageMeta::is_empty")]
    pub meta: MessageMeta,
    #[serde(skip)]
    pub status: MessageStatus,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            meta: MessageMeta::default(),
            status: MessageStatus::Done,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant message that the given session streams into.
    pub fn assistant_placeholder(session_id: SessionId) -> Self {
        Self {
            status: MessageStatus::Streaming(session_id),
            ..Self::assistant(String::new())
        }
    }

    /// Visible report of a failed session.
    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Failed,
            ..Self::assistant(content)
        }
    }

    pub fn with_suggestion(mut self, suggest: impl Into<String>) -> Self {
        self.meta.suggest = Some(suggest.into());
        self
    }

    pub fn is_streaming_for(&self, session_id: SessionId) -> bool {
        self.status == MessageStatus::Streaming(session_id)
    }
}

/// Snapshot of the conversation as published to observers.
///
/// `generation` increases every time the conversation is reset, so an
/// observer that only sees the latest snapshot can still tell a cleared
/// conversation from a continued one of the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub generation: u64,
    pub messages: Vec<ChatMessage>,
}

/// Lifecycle of the controller's current (or most recent) session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Requesting(SessionId),
    Streaming(SessionId),
    Completed(SessionId),
    Aborted(SessionId),
    Errored {
        session_id: SessionId,
        message: String,
    },
}

/// Input to [`SessionPhase::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    Request(SessionId),
    Open(SessionId),
    Complete(SessionId),
    Abort(SessionId),
    Fail {
        session_id: SessionId,
        message: String,
    },
}

/// Reason a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyActive {
        active: SessionId,
        attempted: SessionId,
    },
    NoActiveSession,
    SessionMismatch {
        active: SessionId,
        attempted: SessionId,
    },
    NotStreaming(SessionId),
}

pub type PhaseResult = Result<SessionPhase, PhaseRejection>;

impl SessionPhase {
    /// Session currently requesting or streaming, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        match self {
            Self::Requesting(id) | Self::Streaming(id) => Some(*id),
            Self::Idle | Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. } => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Aborted(_) | Self::Errored { .. }
        )
    }

    /// Applies one transition.
    ///
    /// A new request is only accepted once no session is active; every other
    /// transition must name the active session exactly.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Request(session_id) => match self.active_session() {
                Some(active) => Err(PhaseRejection::AlreadyActive {
                    active,
                    attempted: session_id,
                }),
                None => Ok(Self::Requesting(session_id)),
            },
            PhaseTransition::Open(session_id) => match self {
                Self::Requesting(active) if *active == session_id => {
                    Ok(Self::Streaming(session_id))
                }
                _ => Err(self.mismatch(session_id)),
            },
            PhaseTransition::Complete(session_id) => match self {
                Self::Streaming(active) if *active == session_id => {
                    Ok(Self::Completed(session_id))
                }
                Self::Requesting(active) if *active == session_id => {
                    Err(PhaseRejection::NotStreaming(session_id))
                }
                _ => Err(self.mismatch(session_id)),
            },
            PhaseTransition::Abort(session_id) => {
                self.end_active(session_id, Self::Aborted(session_id))
            }
            PhaseTransition::Fail {
                session_id,
                message,
            } => self.end_active(
                session_id,
                Self::Errored {
                    session_id,
                    message,
                },
            ),
        }
    }

    fn end_active(&self, session_id: SessionId, next: Self) -> PhaseResult {
        match self.active_session() {
            Some(active) if active == session_id => Ok(next),
            _ => Err(self.mismatch(session_id)),
        }
    }

    fn mismatch(&self, attempted: SessionId) -> PhaseRejection {
        match self.active_session() {
            Some(active) => PhaseRejection::SessionMismatch { active, attempted },
            None => PhaseRejection::NoActiveSession,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const FIRST: SessionId = SessionId::new(1);
    const SECOND: SessionId = SessionId::new(2);

    #[test]
    fn wire_form_omits_local_status_and_empty_meta() {
        let plain = serde_json::to_value(ChatMessage::assistant_placeholder(FIRST)).unwrap();
        assert_eq!(plain, json!({"role": "assistant", "content": ""}));

        let mut routed = ChatMessage::user("hi").with_suggestion("ask more");
        routed.meta.channel = Some("router".to_string());
        routed
            .meta
            .extra
            .insert("station".to_string(), json!("BTS-001"));
        assert_eq!(
            serde_json::to_value(&routed).unwrap(),
            json!({
                "role": "user",
                "content": "hi",
                "meta": {"channel": "router", "suggest": "ask more", "station": "BTS-001"}
            })
        );
    }

    #[test]
    fn unknown_meta_keys_round_trip_through_side_map() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "x",
            "meta": {"suggest": "s", "confidence": 0.6}
        }))
        .unwrap();
        assert_eq!(message.meta.suggest.as_deref(), Some("s"));
        assert_eq!(message.meta.extra.get("confidence"), Some(&json!(0.6)));
        assert_eq!(message.status, MessageStatus::Done);
    }

    #[test]
    fn happy_path_reaches_completed() {
        let phase = SessionPhase::Idle
            .apply(PhaseTransition::Request(FIRST))
            .and_then(|phase| phase.apply(PhaseTransition::Open(FIRST)))
            .and_then(|phase| phase.apply(PhaseTransition::Complete(FIRST)))
            .unwrap();
        assert_eq!(phase, SessionPhase::Completed(FIRST));
        assert!(phase.is_terminal());
        assert_eq!(phase.active_session(), None);
    }

    #[test]
    fn request_while_active_is_rejected() {
        let streaming = SessionPhase::Streaming(FIRST);
        assert_eq!(
            streaming.apply(PhaseTransition::Request(SECOND)),
            Err(PhaseRejection::AlreadyActive {
                active: FIRST,
                attempted: SECOND,
            })
        );
    }

    #[test]
    fn abort_and_fail_require_the_active_session() {
        let requesting = SessionPhase::Requesting(FIRST);
        assert_eq!(
            requesting.apply(PhaseTransition::Abort(FIRST)),
            Ok(SessionPhase::Aborted(FIRST))
        );
        assert_eq!(
            requesting.apply(PhaseTransition::Fail {
                session_id: FIRST,
                message: "no body".to_string(),
            }),
            Ok(SessionPhase::Errored {
                session_id: FIRST,
                message: "no body".to_string(),
            })
        );
        assert_eq!(
            requesting.apply(PhaseTransition::Abort(SECOND)),
            Err(PhaseRejection::SessionMismatch {
                active: FIRST,
                attempted: SECOND,
            })
        );
        assert_eq!(
            SessionPhase::Completed(FIRST).apply(PhaseTransition::Abort(FIRST)),
            Err(PhaseRejection::NoActiveSession)
        );
    }

    #[test]
    fn complete_requires_an_open_stream() {
        assert_eq!(
            SessionPhase::Requesting(FIRST).apply(PhaseTransition::Complete(FIRST)),
            Err(PhaseRejection::NotStreaming(FIRST))
        );
    }
}
