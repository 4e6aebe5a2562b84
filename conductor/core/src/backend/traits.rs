//! Collaborator Traits
//!
//! The two external processes the controllers talk to. Both are
//! fire-and-forget: a method returns as soon as the request is issued and
//! the outcome arrives later as an [`EngineEvent`](crate::events::EngineEvent)
//! on the [`EventBus`](crate::bus::EventBus).
//!
//! # Design Philosophy
//!
//! `load_only`, `start_chat` and `stop_chat` return immediately and report
//! outcomes as events. An implementation may publish those events before it
//! returns: callers invoke these methods with none of their own state locked.

use async_trait::async_trait;

use crate::error::ConductorError;
use crate::generation::GenerationConfig;
use crate::messages::RequestId;
use crate::models::ModelDescriptor;

/// Lists and loads models
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// List available models
    ///
    /// Failures surface as [`ConductorError::Provider`].
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ConductorError>;

    /// Ask the engine to load a model
    ///
    /// Emits `model_loaded` or `model_load_error` later. An `Err` here means
    /// the request could not be issued at all.
    fn load_only(&self, model_id: &str) -> Result<(), ConductorError>;
}

/// Generates streamed replies
pub trait InferenceEngine: Send + Sync {
    /// Begin a generation
    ///
    /// Emits `chat_token`, then exactly one of `chat_done` or `chat_error`.
    fn start_chat(&self, request: ChatRequest) -> Result<(), ConductorError>;

    /// Cancel the current generation, if any
    fn stop_chat(&self) -> Result<(), ConductorError>;
}

/// One generation request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    /// Tag for the events this request produces
    pub request_id: RequestId,
    /// User prompt
    pub prompt: String,
    /// Model to generate with
    pub model_id: String,
    /// Parameters captured when the request was started
    pub config: GenerationConfig,
}

impl ChatRequest {
    /// Create a request with default generation parameters
    pub fn new(request_id: RequestId, prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            request_id,
            prompt: prompt.into(),
            model_id: model_id.into(),
            config: GenerationConfig::default(),
        }
    }

    /// Set generation parameters
    #[must_use]
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_builder() {
        let id = RequestId::new();
        let config = GenerationConfig {
            temperature: 1.2,
            ..GenerationConfig::default()
        };
        let request = ChatRequest::new(id, "Hello", "llama3").with_config(config);

        assert_eq!(request.request_id, id);
        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.model_id, "llama3");
        assert!((request.config.temperature - 1.2).abs() < f64::EPSILON);
    }
}
