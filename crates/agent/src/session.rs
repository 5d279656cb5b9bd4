//! Stream session controller.
//!
//! Owns the conversation and runs one streaming exchange at a time. Each
//! exchange is a tokio task that decodes the response body, strips reasoning
//! out of token deltas, appends the visible text to its placeholder message
//! and republishes logs and charts on the bus. Starting a new exchange (or
//! clearing, or dropping the controller) detaches the running one: its
//! session id stops matching and whatever it reads afterwards is discarded.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use workbench_bus::Subscription;
use workbench_stream::{
    StreamEvent, ThinkStripper, ToolInvocation, decode_stream, recover_plotly_spec,
};

use crate::chat::{
    ChatMessage, MessageStatus, PhaseTransition, SessionId, SessionPhase, Transcript,
};
use crate::client::{ChatRequest, ChatTransport, HttpTransport};
use crate::collab::{CollaboratorClient, Station};
use crate::error::{AgentError, AgentResult, MissingBodySnafu};
use crate::events::{
    CHAT_ASK_STATION, CMD_CHANNEL, ROUTER_CHANNEL, STATION_SELECTED, THINK_CHANNEL,
    WorkbenchBus, WorkbenchEvent,
};
use crate::settings::Settings;

pub const CLEARED_LOG_MESSAGE: &str = "Conversation cleared (long-term memory is kept)";
pub const FAILURE_PREFIX: &str = "Stream error: ";

/// `clear` or `/clear`, case-insensitive, surrounding whitespace ignored.
pub fn is_clear_command(text: &str) -> bool {
    let text = text.trim();
    text.strip_prefix('/')
        .unwrap_or(text)
        .eq_ignore_ascii_case("clear")
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Superseded, cancelled or torn down.
    Aborted,
    Errored(String),
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Blank input; nothing happened.
    Ignored,
    /// The conversation was reset to the greeting.
    Cleared,
    Started(SessionHandle),
}

impl SendOutcome {
    pub fn into_handle(self) -> Option<SessionHandle> {
        match self {
            Self::Started(handle) => Some(handle),
            Self::Ignored | Self::Cleared => None,
        }
    }
}

/// Handle to a running session task.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    message_index: usize,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Index of the placeholder this session streams into.
    pub fn message_index(&self) -> usize {
        self.message_index
    }

    pub async fn join(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %error,
                    "session task did not finish"
                );
                SessionOutcome::Aborted
            }
        }
    }
}

struct ActiveSession {
    id: SessionId,
    message_index: usize,
    cancel: oneshot::Sender<()>,
}

struct ControllerState {
    messages: Vec<ChatMessage>,
    phase: SessionPhase,
    active: Option<ActiveSession>,
    next_session_id: u64,
    // Bumped on every reset of `messages`.
    generation: u64,
}

struct Shared {
    state: Mutex<ControllerState>,
    snapshots: watch::Sender<Transcript>,
    bus: WorkbenchBus,
    transport: Arc<dyn ChatTransport>,
    greeting: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ControllerState) {
        self.snapshots.send_replace(Transcript {
            generation: state.generation,
            messages: state.messages.clone(),
        });
    }

    fn send(self: &Arc<Self>, text: &str, context: Option<Value>) -> SendOutcome {
        let ask = text.trim();
        if ask.is_empty() {
            return SendOutcome::Ignored;
        }

        let mut state = self.lock();
        self.detach_active(&mut state, "superseded by a new send");

        if is_clear_command(ask) {
            state.messages = vec![ChatMessage::assistant(self.greeting.clone())];
            state.generation += 1;
            self.publish(&state);
            drop(state);

            tracing::info!("conversation cleared");
            self.bus
                .emit(WorkbenchEvent::log(CMD_CHANNEL, CLEARED_LOG_MESSAGE));
            return SendOutcome::Cleared;
        }

        state.messages.push(ChatMessage::user(ask));
        let request = ChatRequest {
            messages: state.messages.clone(),
            context,
        };

        let session_id = SessionId::new(state.next_session_id);
        state.next_session_id += 1;
        let message_index = state.messages.len();
        state
            .messages
            .push(ChatMessage::assistant_placeholder(session_id));

        let (cancel, cancelled) = oneshot::channel();
        state.active = Some(ActiveSession {
            id: session_id,
            message_index,
            cancel,
        });
        apply_transition(&mut state, PhaseTransition::Request(session_id));
        self.publish(&state);
        drop(state);

        tracing::debug!(session_id = %session_id, message_index, "starting chat session");
        let task = tokio::spawn(run_session(
            Arc::downgrade(self),
            Arc::clone(&self.transport),
            session_id,
            request,
            cancelled,
        ));

        SendOutcome::Started(SessionHandle {
            session_id,
            message_index,
            task,
        })
    }

    fn cancel(&self) -> bool {
        let mut state = self.lock();
        let cancelled = self
            .detach_active(&mut state, "cancelled by caller")
            .is_some();
        if cancelled {
            self.publish(&state);
        }
        cancelled
    }

    // Takes the active session out of the state and fires its cancel signal.
    fn detach_active(
        &self,
        state: &mut ControllerState,
        reason: &'static str,
    ) -> Option<SessionId> {
        let ActiveSession {
            id,
            message_index,
            cancel,
        } = state.active.take()?;
        let _ = cancel.send(());

        if let Some(message) = state.messages.get_mut(message_index)
            && message.is_streaming_for(id)
        {
            message.status = MessageStatus::Cancelled;
        }
        apply_transition(state, PhaseTransition::Abort(id));
        tracing::debug!(session_id = %id, reason, "detached chat session");
        Some(id)
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|active| active.id == session_id)
    }

    /// Runs `update` on the placeholder of `session_id` while it is still the
    /// active session. `None` means the session was detached.
    fn with_target<R>(
        &self,
        session_id: SessionId,
        update: impl FnOnce(&mut ChatMessage) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        let index = state
            .active
            .as_ref()
            .filter(|active| active.id == session_id)?
            .message_index;
        let result = update(state.messages.get_mut(index)?);
        self.publish(&state);
        Some(result)
    }

    fn transition(&self, session_id: SessionId, transition: PhaseTransition) -> bool {
        let mut state = self.lock();
        if !state
            .active
            .as_ref()
            .is_some_and(|active| active.id == session_id)
        {
            return false;
        }
        apply_transition(&mut state, transition);
        true
    }

    /// Ends `session_id` if it is still active and releases its slot.
    fn finish(
        &self,
        session_id: SessionId,
        transition: PhaseTransition,
        finalize: impl FnOnce(&mut ControllerState, usize),
    ) -> bool {
        let mut state = self.lock();
        let Some(active) = state.active.take_if(|active| active.id == session_id) else {
            return false;
        };

        finalize(&mut *state, active.message_index);
        apply_transition(&mut state, transition);
        self.publish(&state);
        true
    }

    fn release(&self, session_id: SessionId) {
        let mut state = self.lock();
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.id == session_id)
        {
            self.detach_active(&mut state, "session task ended without finishing");
            self.publish(&state);
        }
    }
}

fn apply_transition(state: &mut ControllerState, transition: PhaseTransition) {
    match state.phase.apply(transition) {
        Ok(next) => state.phase = next,
        Err(rejection) => tracing::warn!(
            phase = ?state.phase,
            ?rejection,
            "rejected session phase transition"
        ),
    }
}

/// Conversation owner and single-flight stream session runner.
///
/// Must be used from within a tokio runtime: every send spawns its session on
/// the ambient runtime.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        bus: WorkbenchBus,
        greeting: impl Into<String>,
    ) -> Self {
        let greeting = greeting.into();
        let messages = vec![ChatMessage::assistant(greeting.clone())];
        let (snapshots, _) = watch::channel(Transcript {
            generation: 0,
            messages: messages.clone(),
        });

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState {
                    messages,
                    phase: SessionPhase::Idle,
                    active: None,
                    next_session_id: 1,
                    generation: 0,
                }),
                snapshots,
                bus,
                transport,
                greeting,
            }),
        }
    }

    /// Controller backed by the HTTP transport at `settings.api_base`.
    pub fn from_settings(settings: &Settings, bus: WorkbenchBus) -> AgentResult<Self> {
        let transport = HttpTransport::new(settings)?;
        Ok(Self::new(
            Arc::new(transport),
            bus,
            settings.greeting.clone(),
        ))
    }

    pub fn send(&self, text: &str) -> SendOutcome {
        self.shared.send(text, None)
    }

    pub fn send_with_context(&self, text: &str, context: Value) -> SendOutcome {
        self.shared.send(text, Some(context))
    }

    /// Sends `question` with the station attached as request context.
    pub fn ask_about_station(&self, station: &Station, question: &str) -> SendOutcome {
        self.shared.send(question, station_context(station))
    }

    /// Cancels the running session, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.lock().messages.clone()
    }

    /// Receiver of the latest [`Transcript`], republished after every mutation.
    pub fn subscribe_transcript(&self) -> watch::Receiver<Transcript> {
        self.shared.snapshots.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    pub fn bus(&self) -> &WorkbenchBus {
        &self.shared.bus
    }

    /// Appends the assistant's acknowledgement of a station picked elsewhere.
    pub fn announce_station(&self, station: &Station) {
        announce_station(&self.shared, station);
    }

    /// Subscribes the controller to `chat:ask-station` and `station:selected`.
    ///
    /// Handlers hold only a weak reference; once the controller is dropped
    /// they do nothing. With a collaborator client, asking about a station
    /// also reports the selection to the backend in the background.
    pub fn bind_bus(&self, collaborator: Option<CollaboratorClient>) -> Vec<Subscription> {
        let ask = {
            let shared = Arc::downgrade(&self.shared);
            self.shared.bus.on(CHAT_ASK_STATION, move |event| {
                let WorkbenchEvent::ChatAskStation(request) = event else {
                    return;
                };
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if let Some(collaborator) = &collaborator {
                    collaborator.report_selection_detached(&request.station.id);
                }
                shared.send(&request.question, station_context(&request.station));
            })
        };

        let selected = {
            let shared = Arc::downgrade(&self.shared);
            self.shared.bus.on(STATION_SELECTED, move |event| {
                if let WorkbenchEvent::StationSelected(station) = event
                    && let Some(shared) = shared.upgrade()
                {
                    announce_station(&shared, station);
                }
            })
        };

        vec![ask, selected]
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

fn announce_station(shared: &Shared, station: &Station) {
    let message = ChatMessage::assistant(format!(
        "Selected {} ({}). Want its coverage, load or alarm history?",
        station.label(),
        station.id
    ))
    .with_suggestion("Try: what is the coverage radius of this station?");

    let mut state = shared.lock();
    state.messages.push(message);
    shared.publish(&state);
}

fn station_context(station: &Station) -> Option<Value> {
    match serde_json::to_value(station) {
        Ok(station) => Some(json!({ "station": station })),
        Err(error) => {
            tracing::warn!(
                station_id = %station.id,
                error = %error,
                "failed to encode station context"
            );
            None
        }
    }
}

enum Step {
    Continue,
    End,
    Detached,
}

// Per-task state; never shared.
struct SessionRun {
    shared: Weak<Shared>,
    session_id: SessionId,
    stripper: ThinkStripper,
    visible: String,
}

impl SessionRun {
    fn apply(&mut self, event: StreamEvent) -> Step {
        let Some(shared) = self.shared.upgrade() else {
            return Step::Detached;
        };

        match event {
            StreamEvent::Start => self.current(&shared),
            StreamEvent::Token { delta } => self.apply_token(&shared, &delta),
            StreamEvent::Log { channel, message } => {
                let channel = channel
                    .filter(|channel| !channel.trim().is_empty())
                    .unwrap_or_else(|| THINK_CHANNEL.to_string());
                let current = if channel == ROUTER_CHANNEL {
                    shared
                        .with_target(self.session_id, |target| {
                            target.meta.channel = Some(ROUTER_CHANNEL.to_string());
                        })
                        .is_some()
                } else {
                    shared.is_current(self.session_id)
                };
                if !current {
                    return Step::Detached;
                }
                shared.bus.emit(WorkbenchEvent::log(channel, message));
                Step::Continue
            }
            StreamEvent::Tool(tool) => {
                if !shared.is_current(self.session_id) {
                    return Step::Detached;
                }
                match tool {
                    ToolInvocation::Plotly { spec, specs, title } => {
                        shared.bus.emit(WorkbenchEvent::chart(spec, specs, title));
                    }
                    ToolInvocation::PlotlyBatch { items, title } => {
                        shared.bus.emit(WorkbenchEvent::chart_batch(items, title));
                    }
                    ToolInvocation::Other => {
                        tracing::debug!(
                            session_id = %self.session_id,
                            "ignoring unsupported tool payload"
                        );
                    }
                }
                Step::Continue
            }
            StreamEvent::End => Step::End,
        }
    }

    fn current(&self, shared: &Shared) -> Step {
        if shared.is_current(self.session_id) {
            Step::Continue
        } else {
            Step::Detached
        }
    }

    fn apply_token(&mut self, shared: &Shared, delta: &str) -> Step {
        let stripped = self.stripper.strip(delta);
        if !stripped.reasoning.is_empty() {
            if !shared.is_current(self.session_id) {
                return Step::Detached;
            }
            // Reasoning precedes the visible text that followed it.
            for summary in stripped.reasoning {
                shared.bus.emit(WorkbenchEvent::log(THINK_CHANNEL, summary));
            }
        }

        let visible = stripped.visible;
        let applied = if visible.is_empty() {
            shared.is_current(self.session_id)
        } else {
            shared
                .with_target(self.session_id, |target| target.content.push_str(&visible))
                .is_some()
        };
        if !applied {
            return Step::Detached;
        }

        self.visible.push_str(&visible);
        Step::Continue
    }

    fn complete(&mut self, recover: bool) -> SessionOutcome {
        let Some(shared) = self.shared.upgrade() else {
            return SessionOutcome::Aborted;
        };
        if !shared.is_current(self.session_id) {
            return SessionOutcome::Aborted;
        }
        if self.stripper.in_reasoning() {
            tracing::debug!(
                session_id = %self.session_id,
                pending_bytes = self.stripper.pending_reasoning().len(),
                "stream ended inside a reasoning block"
            );
        }

        if recover && let Some(spec) = recover_plotly_spec(&self.visible) {
            shared.bus.emit(WorkbenchEvent::chart(spec, None, None));
        }

        let session_id = self.session_id;
        let finished = shared.finish(
            session_id,
            PhaseTransition::Complete(session_id),
            |state, index| {
                if let Some(target) = state.messages.get_mut(index)
                    && target.is_streaming_for(session_id)
                {
                    target.status = MessageStatus::Done;
                }
            },
        );
        if !finished {
            return SessionOutcome::Aborted;
        }

        tracing::debug!(
            session_id = %session_id,
            visible_chars = self.visible.chars().count(),
            "chat session completed"
        );
        SessionOutcome::Completed
    }

    fn fail(&self, error: AgentError) -> SessionOutcome {
        let description = error.to_string();
        let Some(shared) = self.shared.upgrade() else {
            return SessionOutcome::Aborted;
        };

        let session_id = self.session_id;
        let finished = shared.finish(
            session_id,
            PhaseTransition::Fail {
                session_id,
                message: description.clone(),
            },
            |state, index| {
                if let Some(target) = state.messages.get_mut(index)
                    && target.is_streaming_for(session_id)
                {
                    target.status = MessageStatus::Done;
                }
                state
                    .messages
                    .push(ChatMessage::failure(format!("{FAILURE_PREFIX}{description}")));
            },
        );
        if !finished {
            tracing::debug!(
                session_id = %session_id,
                error = %description,
                "dropping error from detached session"
            );
            return SessionOutcome::Aborted;
        }

        tracing::error!(session_id = %session_id, error = %description, "chat session failed");
        SessionOutcome::Errored(description)
    }
}

// Releases the session slot on any exit path, including panics and task abort.
struct SessionGuard {
    shared: Weak<Shared>,
    session_id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(self.session_id);
        }
    }
}

async fn run_session(
    shared: Weak<Shared>,
    transport: Arc<dyn ChatTransport>,
    session_id: SessionId,
    request: ChatRequest,
    mut cancelled: oneshot::Receiver<()>,
) -> SessionOutcome {
    let _guard = SessionGuard {
        shared: shared.clone(),
        session_id,
    };
    let mut run = SessionRun {
        shared,
        session_id,
        stripper: ThinkStripper::new(),
        visible: String::new(),
    };

    let opened = tokio::select! {
        biased;
        _ = &mut cancelled => return SessionOutcome::Aborted,
        opened = transport.open_stream(request) => opened,
    };
    let body = match opened {
        Ok(Some(body)) => body,
        Ok(None) => {
            return run.fail(
                MissingBodySnafu {
                    stage: "open-chat-stream",
                }
                .build(),
            );
        }
        Err(error) => return run.fail(error),
    };

    let opened = run
        .shared
        .upgrade()
        .is_some_and(|shared| shared.transition(session_id, PhaseTransition::Open(session_id)));
    if !opened {
        return SessionOutcome::Aborted;
    }

    let mut events = pin!(decode_stream(body));
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut cancelled => return SessionOutcome::Aborted,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => match run.apply(event) {
                Step::Continue => {}
                Step::End => return run.complete(true),
                Step::Detached => return SessionOutcome::Aborted,
            },
            Some(Err(error)) => return run.fail(error),
            None => {
                tracing::warn!(session_id = %session_id, "chat stream closed without an end event");
                return run.complete(false);
            }
        }
    }
}
