//! Error Types
//!
//! Every fallible operation on the controllers returns a [`ConductorError`].
//! Local validation failures are returned synchronously and never reach the
//! event layer; engine failures arrive as events and are surfaced as
//! [`ConductorError::Engine`].

use thiserror::Error;

/// A rejected input, detected before any state is touched
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ValidationError {
    /// The configuration key is not known
    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    /// The value has the wrong kind for this key
    #[error("{key} expects {expected}")]
    WrongType {
        /// The key being set
        key: &'static str,
        /// Description of the accepted kind
        expected: &'static str,
    },

    /// The value lies outside the field's declared range
    #[error("{key} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// The key being set
        key: &'static str,
        /// Lower bound (inclusive)
        min: f64,
        /// Upper bound (inclusive)
        max: f64,
        /// The rejected value
        value: f64,
    },

    /// Empty or whitespace-only prompt
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    /// Prompt longer than the configured limit
    #[error("Prompt is {length} characters (max: {max})")]
    PromptTooLong {
        /// Length of the rejected prompt in characters
        length: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Errors returned by the chat controllers
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConductorError {
    /// Bad config value or prompt
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Generation attempted without a loaded, selected model
    #[error("No model is loaded")]
    NotReady,

    /// Generation attempted while another one is in flight
    #[error("A generation is already in progress")]
    AlreadyGenerating,

    /// Load attempted while another load is in flight
    #[error("Model {loading} is still loading")]
    Busy {
        /// The model currently loading
        loading: String,
    },

    /// Model provider failure (listing or load request)
    #[error("Model provider error: {0}")]
    Provider(String),

    /// Unknown model id
    #[error("Model not found: {0}")]
    NotFound(String),

    /// Failure reported by the inference engine
    #[error("Engine error: {0}")]
    Engine(String),
}

impl ConductorError {
    /// Whether the error was produced by local validation
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
