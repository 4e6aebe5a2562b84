//! Conductor Core - Chat Session Control for localchat
//!
//! This crate provides the client-side control logic for a local chat
//! application: model lifecycle, a single streamed generation with
//! cancellation, and the event wiring to the external inference process.
//! It has no UI dependencies and can drive a terminal, a desktop shell, or
//! a test harness.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Presentation Layer                            │
//! │          (cli REPL, tests, any other surface)                     │
//! │                 ▲                        │                        │
//! │     ConductorMessage (down)     start/stop/load/set (up)          │
//! └─────────────────┼────────────────────────┼────────────────────────┘
//!                   │                        ▼
//! ┌─────────────────┴────────────────────────────────────────────────┐
//! │                        CONDUCTOR CORE                             │
//! │  ┌─────────────┐  ┌────────────────┐  ┌────────────────────────┐  │
//! │  │ ConfigStore │  │ ModelLifecycle │  │   SessionController    │  │
//! │  └─────────────┘  └───────▲────────┘  └───────────▲────────────┘  │
//! │                           │ model_loaded           │ chat_token    │
//! │                           │ model_load_error       │ chat_done     │
//! │                  ┌────────┴───────────────────────┴──────┐ chat_error
//! │                  │      EventBus (SubscriptionSet)        │        │
//! │                  └────────────────▲──────────────────────┘        │
//! └───────────────────────────────────┼───────────────────────────────┘
//!                                     │ EngineEvent
//!                   ┌─────────────────┴─────────────────┐
//!                   │ ModelProvider / InferenceEngine   │
//!                   │ (OllamaBackend, or a test double) │
//!                   └───────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Conductor`]: Owns the controllers and their event subscriptions
//! - [`SessionController`]: Idle/Generating state machine
//! - [`ModelLifecycle`]: Model list, selection and load status
//! - [`ConfigStore`]: Copy-on-write generation parameters
//! - [`EventBus`]: Named events with disposable subscriptions
//! - [`ConductorMessage`]: Messages sent from the Conductor to the UI
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use localchat_core::{messages, Conductor, ConductorConfig, EventBus, OllamaBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = messages::channel();
//!     let bus = EventBus::new();
//!     let backend = Arc::new(OllamaBackend::new("localhost", 11434, bus.clone()));
//!
//!     let mut conductor = Conductor::new(
//!         backend.clone(),
//!         backend,
//!         bus,
//!         ConductorConfig::default(),
//!         tx,
//!     );
//!     conductor.activate();
//!
//!     conductor.refresh().await?;
//!     if let Some(id) = conductor.models_snapshot().selected {
//!         conductor.load(&id)?;
//!     }
//!
//!     while let Some(msg) = rx.recv().await {
//!         // Render message to UI
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Collaborator traits and the Ollama adapter
//! - [`bus`]: Event subscription management
//! - [`conductor`]: Main Conductor struct
//! - [`config`]: Settings file and environment overrides
//! - [`error`]: Error taxonomy
//! - [`events`]: Events from the inference process
//! - [`generation`]: Generation parameters
//! - [`messages`]: Messages from the Conductor to the UI
//! - [`models`]: Model lifecycle
//! - [`session`]: Conversation and generation state machine

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod bus;
pub mod conductor;
pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod messages;
pub mod models;
pub mod session;

// Re-exports for convenience
pub use backend::{ChatRequest, InferenceEngine, ModelProvider, OllamaBackend};
pub use bus::{EventBus, Subscription, SubscriptionId, SubscriptionSet};
pub use conductor::{Conductor, ConductorConfig};
pub use error::{ConductorError, ValidationError};
pub use events::{EngineEvent, EventName};
pub use generation::{ConfigKey, ConfigStore, ConfigValue, GenerationConfig, MirostatMode};
pub use messages::{
    ConductorMessage, MessageId, MessageReceiver, MessageRole, MessageSender, NotifyLevel,
    RequestId,
};
pub use models::{LoadStatus, LoadStep, ModelDescriptor, ModelLifecycle, ModelSnapshot};
pub use session::{Conversation, Message, SessionController, SessionPhase, SessionState};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, LocalChatConfig, LocalChatToml,
};
