#![deny(unsafe_code)]

pub mod chat;
pub mod client;
pub mod collab;
pub mod error;
pub mod events;
pub mod session;
pub mod settings;

pub use chat::{
    ChatMessage, MessageMeta, MessageStatus, Role, SessionId, SessionPhase, Transcript,
};
pub use client::{
    BoxFuture, ByteStream, CHAT_STREAM_PATH, ChatRequest, ChatTransport, HttpTransport,
};
pub use collab::{CollaboratorClient, CoverageEstimate, Station};
pub use error::{AgentError, AgentResult};
pub use events::{WorkbenchBus, WorkbenchEvent};
pub use session::{SendOutcome, SessionController, SessionHandle, SessionOutcome, is_clear_command};
pub use settings::{Settings, SettingsError, SettingsStore};
