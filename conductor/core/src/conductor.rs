//! Conductor - The Orchestration Core
//!
//! Wires the controllers to the event bus and exposes the entry points a
//! presentation layer needs:
//! - `start` / `stop` a generation
//! - `refresh` / `select` / `load` models
//! - `set_config` generation parameters
//!
//! # Design Philosophy
//!
//! The Conductor is UI-agnostic. It reports everything through
//! [`ConductorMessage`]s and hands out read-only snapshots; only the
//! controllers it owns mutate state.
//!
//! # Subscriptions
//!
//! `activate` registers one handler per engine event and is idempotent.
//! `deactivate` (or dropping the Conductor) disposes all of them together,
//! so reactivation never double-registers. Handlers hold weak references,
//! so an event racing with teardown finds nothing to mutate.
//!
//! # Collaborator Calls
//!
//! The provider and engine are only called with no controller locked. A
//! collaborator may publish events from inside `load_only`, `start_chat` or
//! `stop_chat` and the handlers will find the controllers free.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{InferenceEngine, ModelProvider};
use crate::bus::{EventBus, SubscriptionSet};
use crate::error::ConductorError;
use crate::events::{EngineEvent, EventName};
use crate::generation::{ConfigKey, ConfigStore, ConfigValue, GenerationConfig};
use crate::messages::{ConductorMessage, MessageSender, NotifyLevel, RequestId};
use crate::models::{LoadStep, ModelDescriptor, ModelLifecycle, ModelSnapshot};
use crate::session::{
    Conversation, SessionController, SessionPhase, SessionState, DEFAULT_MAX_PROMPT_CHARS,
};

/// Conductor configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ConductorConfig {
    /// Initial generation parameters
    pub generation: GenerationConfig,
    /// Prompt length limit, in characters
    pub max_prompt_chars: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
        }
    }
}

/// The Conductor - orchestrates models, sessions and config
pub struct Conductor {
    bus: EventBus,
    engine: Arc<dyn InferenceEngine>,
    config: ConfigStore,
    models: Arc<Mutex<ModelLifecycle>>,
    session: Arc<Mutex<SessionController>>,
    subscriptions: SubscriptionSet,
    tx: MessageSender,
}

impl Conductor {
    /// Create an inactive Conductor
    ///
    /// Call [`activate`](Self::activate) before issuing requests, or engine
    /// events will go unheard.
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        engine: Arc<dyn InferenceEngine>,
        bus: EventBus,
        config: ConductorConfig,
        tx: MessageSender,
    ) -> Self {
        let models = ModelLifecycle::new(provider, tx.clone());
        let session =
            SessionController::new(tx.clone()).with_max_prompt_chars(config.max_prompt_chars);

        Self {
            bus,
            engine,
            config: ConfigStore::new(config.generation),
            models: Arc::new(Mutex::new(models)),
            session: Arc::new(Mutex::new(session)),
            subscriptions: SubscriptionSet::new(),
            tx,
        }
    }

    /// Register the engine event handlers
    ///
    /// Returns the number of handlers registered; zero if already active.
    pub fn activate(&mut self) -> usize {
        if !self.subscriptions.is_empty() {
            tracing::debug!("Conductor already active");
            return 0;
        }

        for name in [EventName::ChatToken, EventName::ChatDone, EventName::ChatError] {
            let session = Arc::downgrade(&self.session);
            self.subscriptions
                .push(self.bus.subscribe(name, move |event| {
                    with_live(&session, |s| {
                        s.handle_event(event);
                    });
                }));
        }

        let models = Arc::downgrade(&self.models);
        self.subscriptions
            .push(self.bus.subscribe(EventName::ModelLoaded, move |event| {
                if let EngineEvent::ModelLoaded { model_id } = event {
                    with_live(&models, |m| {
                        m.on_loaded(model_id);
                    });
                }
            }));

        let models = Arc::downgrade(&self.models);
        let tx = self.tx.clone();
        self.subscriptions
            .push(self.bus.subscribe(EventName::ModelLoadError, move |event| {
                if let EngineEvent::ModelLoadError { model_id, reason } = event {
                    let applied = with_live(&models, |m| m.on_load_error(model_id, reason));
                    if applied == Some(true) {
                        send(
                            &tx,
                            ConductorMessage::Notify {
                                level: NotifyLevel::Error,
                                message: format!("Failed to load {model_id}: {reason}"),
                            },
                        );
                    }
                }
            }));

        let count = self.subscriptions.len();
        tracing::info!(handlers = count, "Conductor activated");
        count
    }

    /// Dispose every handler registered by [`activate`](Self::activate)
    ///
    /// Returns the number of handlers removed. Safe to call repeatedly.
    pub fn deactivate(&mut self) -> usize {
        let removed = self.subscriptions.dispose_all();
        if removed > 0 {
            tracing::info!(handlers = removed, "Conductor deactivated");
        }
        removed
    }

    /// Whether the event handlers are registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    // ============================================
    // Session
    // ============================================

    /// Send a prompt to the selected model
    ///
    /// # Errors
    ///
    /// See [`SessionController::start`]; [`ConductorError::NotReady`] unless
    /// the selected model is loaded.
    ///
    /// If the engine refuses the request the session returns to Idle and
    /// [`ConductorError::Engine`] is returned.
    pub fn start(&self, prompt: &str) -> Result<RequestId, ConductorError> {
        let model = self.models.lock().ready_model().map(String::from);
        let config = self.config.get();
        let request = self.session.lock().start(prompt, model.as_deref(), &config)?;

        let request_id = request.request_id;
        if let Err(e) = self.engine.start_chat(request) {
            return Err(self.session.lock().start_failed(request_id, e));
        }
        Ok(request_id)
    }

    /// Cancel the in-flight generation
    ///
    /// The session is Idle when this returns; the engine is told to stop
    /// afterwards. Returns `false` if nothing was generating.
    pub fn stop(&self) -> bool {
        let stopped = self.session.lock().stop();
        if stopped {
            if let Err(e) = self.engine.stop_chat() {
                tracing::warn!(error = %e, "Engine stop request failed");
            }
        }
        stopped
    }

    /// Empty the conversation
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::AlreadyGenerating`] while generating.
    pub fn clear_conversation(&self) -> Result<(), ConductorError> {
        self.session.lock().clear()
    }

    /// Copy of the conversation
    #[must_use]
    pub fn conversation(&self) -> Conversation {
        self.session.lock().conversation().clone()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.session.lock().phase()
    }

    /// Current session state
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.lock().state()
    }

    /// Error that ended the most recent generation
    #[must_use]
    pub fn last_error(&self) -> Option<ConductorError> {
        self.session.lock().last_error().cloned()
    }

    // ============================================
    // Models
    // ============================================

    /// Re-list models from the provider
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Provider`]; the previous model set is kept.
    pub async fn refresh(&self) -> Result<Vec<ModelDescriptor>, ConductorError> {
        // The listing runs without holding the lifecycle lock
        let provider = self.models.lock().provider();
        let listing = provider.list_models().await;
        let mut models = self.models.lock();
        models.apply_listing(listing)?;
        Ok(models.models().to_vec())
    }

    /// Select a known model
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::NotFound`] for an unknown id.
    pub fn select(&self, model_id: &str) -> Result<(), ConductorError> {
        self.models.lock().select(model_id)
    }

    /// Request a model load
    ///
    /// # Errors
    ///
    /// See [`ModelLifecycle::load`].
    pub fn load(&self, model_id: &str) -> Result<(), ConductorError> {
        let (step, provider) = {
            let mut models = self.models.lock();
            (models.begin_load(model_id)?, models.provider())
        };
        if step != LoadStep::Issue {
            return Ok(());
        }
        if let Err(e) = provider.load_only(model_id) {
            return Err(self.models.lock().fail_load(model_id, e));
        }
        Ok(())
    }

    /// Copy of the model lifecycle state
    #[must_use]
    pub fn models_snapshot(&self) -> ModelSnapshot {
        self.models.lock().snapshot()
    }

    // ============================================
    // Config
    // ============================================

    /// Current generation parameters
    #[must_use]
    pub fn config(&self) -> Arc<GenerationConfig> {
        self.config.get()
    }

    /// Validate and set one generation parameter
    ///
    /// Takes effect from the next `start`; an in-flight generation keeps
    /// the parameters it started with.
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Validation`]; the config is unchanged.
    pub fn set_config(
        &self,
        key: ConfigKey,
        value: impl Into<ConfigValue>,
    ) -> Result<(), ConductorError> {
        self.config.set(key, value)?;
        send(&self.tx, ConductorMessage::ConfigChanged { key });
        Ok(())
    }

    /// Parse and set a parameter from user input (`"top_k"`, `"40"`)
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Validation`] for an unknown key or a bad
    /// value.
    pub fn set_config_str(&self, key: &str, value: &str) -> Result<ConfigKey, ConductorError> {
        let key: ConfigKey = key.parse()?;
        let value = ConfigValue::parse_for(key, value)?;
        self.set_config(key, value)?;
        Ok(key)
    }

    /// The event bus engine events arrive on
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("active", &self.is_active())
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

fn send(tx: &MessageSender, msg: ConductorMessage) {
    if tx.send(msg).is_err() {
        tracing::trace!("Message receiver closed");
    }
}

/// Run `f` on the target if it is still alive
fn with_live<T, R>(target: &Weak<Mutex<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let target = target.upgrade()?;
    let mut guard = target.lock();
    Some(f(&mut *guard))
}
