//! Model Provider and Inference Engine
//!
//! Trait seams for the external processes, plus an adapter for a local
//! Ollama server.
//!
//! # Usage
//!
//! ```ignore
//! use localchat_core::backend::{InferenceEngine, OllamaBackend};
//! use localchat_core::bus::EventBus;
//!
//! let bus = EventBus::new();
//! let backend = OllamaBackend::new("localhost", 11434, bus.clone());
//! backend.load_only("llama3")?;
//! ```

mod ollama;
mod traits;

pub use ollama::{OllamaBackend, DEFAULT_HOST, DEFAULT_PORT};
pub use traits::{ChatRequest, InferenceEngine, ModelProvider};
