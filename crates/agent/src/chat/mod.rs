pub mod message;

pub use message::{
    ChatMessage, MessageMeta, MessageStatus, PhaseRejection, PhaseResult, PhaseTransition, Role,
    SessionId, SessionPhase, Transcript,
};
