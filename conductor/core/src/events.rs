//! Engine Events
//!
//! Events published by the external processes (inference engine and model
//! provider) on the [`EventBus`](crate::bus::EventBus). Requests to those
//! processes are fire-and-forget; everything they have to say comes back
//! as one of these events.
//!
//! # Design Philosophy
//!
//! Events report what happened, nothing more. The controllers decide
//! whether an event still matters (a token for a stopped session does not).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::messages::RequestId;

/// Name of an event channel on the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    /// A streamed token (`chat_token`)
    ChatToken,
    /// Generation finished (`chat_done`)
    ChatDone,
    /// Generation failed (`chat_error`)
    ChatError,
    /// A model finished loading (`model_loaded`)
    ModelLoaded,
    /// A model failed to load (`model_load_error`)
    ModelLoadError,
}

impl EventName {
    /// All event names
    pub const ALL: [Self; 5] = [
        Self::ChatToken,
        Self::ChatDone,
        Self::ChatError,
        Self::ModelLoaded,
        Self::ModelLoadError,
    ];

    /// Wire name of the event
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatToken => "chat_token",
            Self::ChatDone => "chat_done",
            Self::ChatError => "chat_error",
            Self::ModelLoaded => "model_loaded",
            Self::ModelLoadError => "model_load_error",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = String;

    /// Accepts the wire names and the short forms `token`, `done`, `error`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "chat_token" | "token" => Ok(Self::ChatToken),
            "chat_done" | "done" => Ok(Self::ChatDone),
            "chat_error" | "error" => Ok(Self::ChatError),
            "model_loaded" => Ok(Self::ModelLoaded),
            "model_load_error" => Ok(Self::ModelLoadError),
            other => Err(format!("unknown event: {other}")),
        }
    }
}

/// An event from the inference engine or model provider
///
/// Chat events carry the [`RequestId`] of the generation that produced them
/// when the engine is able to tag them. Untagged events are attributed to
/// whatever generation is active when they arrive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A streamed token
    ChatToken {
        /// Generation the token belongs to
        request: Option<RequestId>,
        /// Token text
        text: String,
    },

    /// Generation finished normally
    ChatDone {
        /// Generation that finished
        request: Option<RequestId>,
    },

    /// Generation failed
    ChatError {
        /// Generation that failed
        request: Option<RequestId>,
        /// Engine error text
        reason: String,
    },

    /// A model finished loading
    ModelLoaded {
        /// The model
        model_id: String,
    },

    /// A model failed to load
    ModelLoadError {
        /// The model
        model_id: String,
        /// Failure reason
        reason: String,
    },
}

impl EngineEvent {
    /// Untagged token event
    pub fn token(text: impl Into<String>) -> Self {
        Self::ChatToken {
            request: None,
            text: text.into(),
        }
    }

    /// Untagged completion event
    #[must_use]
    pub fn done() -> Self {
        Self::ChatDone { request: None }
    }

    /// Untagged error event
    pub fn error(reason: impl Into<String>) -> Self {
        Self::ChatError {
            request: None,
            reason: reason.into(),
        }
    }

    /// The bus channel this event is published on
    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            Self::ChatToken { .. } => EventName::ChatToken,
            Self::ChatDone { .. } => EventName::ChatDone,
            Self::ChatError { .. } => EventName::ChatError,
            Self::ModelLoaded { .. } => EventName::ModelLoaded,
            Self::ModelLoadError { .. } => EventName::ModelLoadError,
        }
    }

    /// Request tag of a chat event (None for model events or untagged ones)
    #[must_use]
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Self::ChatToken { request, .. }
            | Self::ChatDone { request }
            | Self::ChatError { request, .. } => *request,
            Self::ModelLoaded { .. } | Self::ModelLoadError { .. } => None,
        }
    }
}
