//! Session Controller
//!
//! The generation state machine. Owns the conversation and the single
//! active generation.
//!
//! # States
//!
//! ```text
//!            start()                  on_done() / on_error() / stop()
//!   Idle ─────────────▶ Generating ──────────────────────────────────▶ Idle
//!                         │    ▲
//!                         └────┘ on_token()
//! ```
//!
//! # Stale Events
//!
//! Every `start` mints a fresh [`RequestId`]. Chat events are accepted only
//! while generating, and a tagged event only if its tag is the active
//! request. Anything else belongs to a stopped or finished generation and is
//! dropped without touching the conversation.
//!
//! # Stop
//!
//! `stop` returns to Idle immediately without waiting for the engine to
//! acknowledge. Late events from the stopped generation are stale by the
//! rule above.
//!
//! # Engine Calls
//!
//! The controller never calls the engine itself. `start` returns the
//! [`ChatRequest`] to issue and `stop` reports whether a cancel is due; the
//! owner makes those calls with the controller unlocked, so an engine may
//! answer with events straight away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ChatRequest;
use crate::error::{ConductorError, ValidationError};
use crate::events::EngineEvent;
use crate::generation::GenerationConfig;
use crate::messages::{ConductorMessage, MessageId, MessageRole, MessageSender, RequestId};

/// Default prompt length limit, in characters
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 32_768;

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// Whether tokens are still being appended
    pub streaming: bool,
}

impl Message {
    fn user(content: &str) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
            streaming: false,
        }
    }

    fn placeholder() -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            streaming: true,
        }
    }
}

/// Ordered message log
///
/// Append-only, except that the trailing assistant message grows while a
/// generation streams into it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// All messages, oldest first
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Trailing message, if it is the streaming assistant message `id`
    fn streaming_tail(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.role == MessageRole::Assistant && &m.id == id)
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Generation phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No generation in flight
    #[default]
    Idle,
    /// Exactly one generation in flight
    Generating,
}

/// Phase plus the request being generated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Current phase
    pub phase: SessionPhase,
    /// Active request; `Some` exactly when generating
    pub active_request: Option<RequestId>,
}

/// How a generation ended
enum Outcome {
    Done,
    Failed(String),
    Stopped,
}

/// Session Controller
pub struct SessionController {
    conversation: Conversation,
    state: SessionState,
    /// Assistant message the active generation streams into
    placeholder: Option<MessageId>,
    last_error: Option<ConductorError>,
    max_prompt_chars: usize,
    tx: MessageSender,
}

impl SessionController {
    /// Create an idle controller with an empty conversation
    pub fn new(tx: MessageSender) -> Self {
        Self {
            conversation: Conversation::default(),
            state: SessionState::default(),
            placeholder: None,
            last_error: None,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            tx,
        }
    }

    /// Set the prompt length limit
    #[must_use]
    pub fn with_max_prompt_chars(mut self, max: usize) -> Self {
        self.max_prompt_chars = max;
        self
    }

    /// Start a generation
    ///
    /// `model_id` is the selected model if it is loaded, `None` otherwise.
    /// On success the user message and an empty assistant message are
    /// appended, the session is Generating, and the returned request (with
    /// a copy of `config`) is ready for the engine. If the engine refuses
    /// it, report that with [`start_failed`](Self::start_failed).
    ///
    /// # Errors
    ///
    /// Checked in this order, all before any mutation:
    /// - [`ConductorError::AlreadyGenerating`] while generating
    /// - [`ConductorError::Validation`] for an empty or oversized prompt
    /// - [`ConductorError::NotReady`] without a loaded model
    pub fn start(
        &mut self,
        prompt: &str,
        model_id: Option<&str>,
        config: &GenerationConfig,
    ) -> Result<ChatRequest, ConductorError> {
        if self.is_generating() {
            return Err(ConductorError::AlreadyGenerating);
        }
        if prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        let length = prompt.chars().count();
        if length > self.max_prompt_chars {
            return Err(ValidationError::PromptTooLong {
                length,
                max: self.max_prompt_chars,
            }
            .into());
        }
        let Some(model_id) = model_id else {
            return Err(ConductorError::NotReady);
        };

        let user = Message::user(prompt);
        self.send(ConductorMessage::Message {
            id: user.id.clone(),
            role: MessageRole::User,
            content: user.content.clone(),
        });
        self.conversation.push(user);

        let placeholder = Message::placeholder();
        let message_id = placeholder.id.clone();
        self.conversation.push(placeholder);

        let request_id = RequestId::new();
        self.placeholder = Some(message_id.clone());
        self.state = SessionState {
            phase: SessionPhase::Generating,
            active_request: Some(request_id),
        };
        self.last_error = None;

        tracing::info!(request_id = %request_id, model_id = %model_id, "Generation started");
        self.send(ConductorMessage::StreamStart {
            message_id,
            request_id,
            model_id: model_id.to_string(),
        });
        self.send(ConductorMessage::Phase {
            phase: SessionPhase::Generating,
        });

        Ok(ChatRequest::new(request_id, prompt, model_id).with_config(config.clone()))
    }

    /// The engine refused `request`
    ///
    /// Ends that generation as for [`on_error`](Self::on_error), keeping the
    /// empty assistant message. If the request already ended (the engine
    /// answered before refusing) nothing changes. Returns the error to hand
    /// back to the caller of `start`.
    pub fn start_failed(&mut self, request: RequestId, error: ConductorError) -> ConductorError {
        let reason = match error {
            ConductorError::Engine(reason) => reason,
            other => other.to_string(),
        };
        if self.state.active_request == Some(request) {
            self.finish(Outcome::Failed(reason.clone()));
        }
        ConductorError::Engine(reason)
    }

    /// Handle `chat_token`
    ///
    /// Returns whether the token was appended.
    pub fn on_token(&mut self, request: Option<RequestId>, text: &str) -> bool {
        if !self.accepts(request, "chat_token") {
            return false;
        }
        let Some(id) = self.placeholder.clone() else {
            return false;
        };
        let Some(message) = self.conversation.streaming_tail(&id) else {
            tracing::warn!(message_id = %id, "Streaming message is no longer last");
            return false;
        };
        message.content.push_str(text);
        self.send(ConductorMessage::Token {
            message_id: id,
            text: text.to_string(),
        });
        true
    }

    /// Handle `chat_done`
    ///
    /// Returns whether the active generation was completed. A second call
    /// is a no-op.
    pub fn on_done(&mut self, request: Option<RequestId>) -> bool {
        if !self.accepts(request, "chat_done") {
            return false;
        }
        self.finish(Outcome::Done);
        true
    }

    /// Handle `chat_error`
    ///
    /// Ends the generation and keeps whatever was streamed so far. Returns
    /// the engine error for the caller to surface, or `None` if the event
    /// was stale.
    pub fn on_error(&mut self, request: Option<RequestId>, reason: &str) -> Option<ConductorError> {
        if !self.accepts(request, "chat_error") {
            return None;
        }
        self.finish(Outcome::Failed(reason.to_string()));
        self.last_error.clone()
    }

    /// Cancel the active generation
    ///
    /// Returns to Idle at once. Returns `false` if nothing was generating;
    /// `true` means the engine should be told to stop.
    pub fn stop(&mut self) -> bool {
        if !self.is_generating() {
            return false;
        }
        self.finish(Outcome::Stopped);
        true
    }

    /// Route a chat event to its handler
    ///
    /// Model events are ignored. Returns whether the event was applied.
    pub fn handle_event(&mut self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::ChatToken { request, text } => self.on_token(*request, text),
            EngineEvent::ChatDone { request } => self.on_done(*request),
            EngineEvent::ChatError { request, reason } => self.on_error(*request, reason).is_some(),
            EngineEvent::ModelLoaded { .. } | EngineEvent::ModelLoadError { .. } => false,
        }
    }

    /// Empty the conversation
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::AlreadyGenerating`] while generating.
    pub fn clear(&mut self) -> Result<(), ConductorError> {
        if self.is_generating() {
            return Err(ConductorError::AlreadyGenerating);
        }
        self.conversation.clear();
        self.last_error = None;
        tracing::info!("Conversation cleared");
        self.send(ConductorMessage::ConversationCleared);
        Ok(())
    }

    /// The conversation
    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Whether a generation is in flight
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.state.phase == SessionPhase::Generating
    }

    /// Request being generated
    #[must_use]
    pub fn active_request(&self) -> Option<RequestId> {
        self.state.active_request
    }

    /// Error that ended the most recent generation
    #[must_use]
    pub fn last_error(&self) -> Option<&ConductorError> {
        self.last_error.as_ref()
    }

    /// Prompt length limit
    #[must_use]
    pub fn max_prompt_chars(&self) -> usize {
        self.max_prompt_chars
    }

    fn accepts(&self, request: Option<RequestId>, event: &'static str) -> bool {
        let Some(active) = self.state.active_request else {
            tracing::debug!(event, request = ?request, "Dropping stale event while idle");
            return false;
        };
        match request {
            Some(tag) if tag != active => {
                tracing::debug!(
                    event,
                    request_id = %tag,
                    active_request_id = %active,
                    "Dropping event from superseded request"
                );
                false
            }
            _ => true,
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        let request_id = self.state.active_request.take();
        self.state.phase = SessionPhase::Idle;

        let Some(message_id) = self.placeholder.take() else {
            return;
        };
        let content = match self.conversation.streaming_tail(&message_id) {
            Some(message) => {
                message.streaming = false;
                message.content.clone()
            }
            None => String::new(),
        };

        match outcome {
            Outcome::Done => {
                tracing::info!(request_id = ?request_id, chars = content.len(), "Generation complete");
                self.send(ConductorMessage::StreamEnd {
                    message_id,
                    final_content: content,
                });
            }
            Outcome::Failed(reason) => {
                tracing::warn!(request_id = ?request_id, error = %reason, "Generation failed");
                self.last_error = Some(ConductorError::Engine(reason.clone()));
                self.send(ConductorMessage::StreamError {
                    message_id,
                    error: reason,
                });
            }
            Outcome::Stopped => {
                tracing::info!(request_id = ?request_id, "Generation stopped");
                self.send(ConductorMessage::StreamStopped { message_id });
            }
        }
        self.send(ConductorMessage::Phase {
            phase: SessionPhase::Idle,
        });
    }

    fn send(&self, msg: ConductorMessage) {
        if self.tx.send(msg).is_err() {
            tracing::trace!("Message receiver closed");
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .field("messages", &self.conversation.len())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}
