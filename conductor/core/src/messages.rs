//! Conductor Messages
//!
//! Messages sent from the controllers to the presentation layer. The
//! presentation layer renders what it is told; all state lives in the core.
//!
//! Messages travel over an unbounded `tokio` channel so that event handlers
//! can publish them without awaiting.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::generation::ConfigKey;
use crate::models::LoadStatus;
use crate::session::SessionPhase;

/// Sending half used by the controllers
pub type MessageSender = mpsc::UnboundedSender<ConductorMessage>;

/// Receiving half handed to the presentation layer
pub type MessageReceiver = mpsc::UnboundedReceiver<ConductorMessage>;

/// Create a notification channel
#[must_use]
pub fn channel() -> (MessageSender, MessageReceiver) {
    mpsc::unbounded_channel()
}

/// Messages from the controllers to the UI
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConductorMessage {
    // ============================================
    // Conversation Messages
    // ============================================
    /// A complete message was appended
    Message {
        /// Message ID
        id: MessageId,
        /// Who sent it
        role: MessageRole,
        /// Full content
        content: String,
    },

    /// An empty assistant message was appended and generation started
    StreamStart {
        /// Placeholder message ID
        message_id: MessageId,
        /// Generation request this stream belongs to
        request_id: RequestId,
        /// Model generating the reply
        model_id: String,
    },

    /// A streamed token was appended
    Token {
        /// Message the token belongs to
        message_id: MessageId,
        /// The token text
        text: String,
    },

    /// Generation completed
    StreamEnd {
        /// Message that completed
        message_id: MessageId,
        /// Final content of the message
        final_content: String,
    },

    /// Generation failed; partial content is kept
    StreamError {
        /// Message that errored
        message_id: MessageId,
        /// Engine error text
        error: String,
    },

    /// Generation was stopped by the user
    StreamStopped {
        /// Message that was stopped
        message_id: MessageId,
    },

    /// Session phase changed
    Phase {
        /// The new phase
        phase: SessionPhase,
    },

    /// Conversation was cleared
    ConversationCleared,

    // ============================================
    // Model Messages
    // ============================================
    /// Model list replaced
    ModelsRefreshed {
        /// Number of models now known
        count: usize,
        /// Selection after the refresh
        selected: Option<String>,
    },

    /// Model selection changed
    ModelSelected {
        /// Newly selected model
        model_id: Option<String>,
    },

    /// Load status of a model changed
    ModelStatus {
        /// The model
        model_id: String,
        /// Its new status
        status: LoadStatus,
    },

    // ============================================
    // System Messages
    // ============================================
    /// A generation parameter changed
    ConfigChanged {
        /// The key that changed
        key: ConfigKey,
    },

    /// User-facing notification
    Notify {
        /// Notification level
        level: NotifyLevel,
        /// Message content
        message: String,
    },
}

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("msg_{id}"))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single generation request
///
/// Minted fresh for every `start`. Events tagged with a request ID other
/// than the active one belong to a superseded session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0.simple())
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Notification levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}
