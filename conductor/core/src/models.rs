//! Model Lifecycle
//!
//! Tracks the models the provider knows about, which one is selected, and
//! the load status of each.
//!
//! # Load Discipline
//!
//! The inference engine holds one model at a time, so only one load may be
//! outstanding. A second `load` for a different id while one is in flight
//! fails with [`ConductorError::Busy`]. Load outcomes arrive as
//! `model_loaded` / `model_load_error` events; outcomes for an id that is
//! not currently loading are ignored.
//!
//! A provider may report the outcome before `load_only` even returns.
//! Owners that share the controller behind a lock use
//! [`ModelLifecycle::begin_load`] and [`ModelLifecycle::fail_load`] and call
//! the provider in between, unlocked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::ModelProvider;
use crate::error::ConductorError;
use crate::messages::{ConductorMessage, MessageSender};

/// A model available from the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model identifier
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// File name on disk (or registry tag)
    pub filename: String,
    /// Full path on disk, if known
    pub filepath: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub modified_at: Option<DateTime<Utc>>,
    /// Whether the model is present locally
    pub is_downloaded: bool,
}

impl ModelDescriptor {
    /// Descriptor with only an id; the id doubles as display and file name
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            filename: id.clone(),
            filepath: String::new(),
            size_bytes: 0,
            modified_at: None,
            is_downloaded: true,
            id,
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the size in bytes
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// Load state of one model
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    /// Not resident in the engine
    #[default]
    NotLoaded,
    /// Load requested, outcome pending
    Loading,
    /// Resident and ready for generation
    Loaded,
    /// Last load attempt failed
    Failed(String),
}

impl LoadStatus {
    /// Short label for display
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::NotLoaded => "not loaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed(_) => "failed",
        }
    }
}

/// What a load request needs next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStep {
    /// Marked loading; the provider must be asked
    Issue,
    /// This model is already loading
    InFlight,
    /// This model is already loaded
    Resident,
}

/// Read-only view of the lifecycle state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Known models, in provider order
    pub models: Vec<ModelDescriptor>,
    /// Selected model id
    pub selected: Option<String>,
    /// Model currently loading
    pub loading: Option<String>,
    /// Status per model id (absent ids are not loaded)
    pub statuses: HashMap<String, LoadStatus>,
}

impl ModelSnapshot {
    /// Status of a model, defaulting to not loaded
    #[must_use]
    pub fn status(&self, id: &str) -> LoadStatus {
        self.statuses.get(id).cloned().unwrap_or_default()
    }
}

/// Model Lifecycle Controller
pub struct ModelLifecycle {
    provider: Arc<dyn ModelProvider>,
    models: Vec<ModelDescriptor>,
    selected: Option<String>,
    statuses: HashMap<String, LoadStatus>,
    loading: Option<String>,
    tx: MessageSender,
}

impl ModelLifecycle {
    /// Create a controller with an empty model set
    pub fn new(provider: Arc<dyn ModelProvider>, tx: MessageSender) -> Self {
        Self {
            provider,
            models: Vec::new(),
            selected: None,
            statuses: HashMap::new(),
            loading: None,
            tx,
        }
    }

    /// The provider, for issuing a listing outside any lock
    #[must_use]
    pub fn provider(&self) -> Arc<dyn ModelProvider> {
        Arc::clone(&self.provider)
    }

    /// List models from the provider and apply the result
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Provider`] if listing fails; prior state is
    /// kept.
    pub async fn refresh(&mut self) -> Result<&[ModelDescriptor], ConductorError> {
        let listing = self.provider.list_models().await;
        self.apply_listing(listing)?;
        Ok(&self.models)
    }

    /// Apply the outcome of a provider listing
    ///
    /// On success the model set is replaced wholesale. If the selected id
    /// is gone, selection falls back to the first model (or none).
    ///
    /// # Errors
    ///
    /// Returns the listing error unchanged; prior state is kept.
    pub fn apply_listing(
        &mut self,
        listing: Result<Vec<ModelDescriptor>, ConductorError>,
    ) -> Result<(), ConductorError> {
        let models = match listing {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "Model listing failed");
                return Err(match e {
                    ConductorError::Provider(_) => e,
                    other => ConductorError::Provider(other.to_string()),
                });
            }
        };

        let previous = self.selected.clone();
        let keep = previous
            .as_deref()
            .is_some_and(|id| models.iter().any(|m| m.id == id));
        self.selected = if keep {
            previous.clone()
        } else {
            models.first().map(|m| m.id.clone())
        };

        let loading = self.loading.clone();
        self.statuses.retain(|id, _| {
            models.iter().any(|m| &m.id == id) || loading.as_deref() == Some(id.as_str())
        });
        self.models = models;

        tracing::info!(
            count = self.models.len(),
            selected = ?self.selected,
            "Model list refreshed"
        );
        self.send(ConductorMessage::ModelsRefreshed {
            count: self.models.len(),
            selected: self.selected.clone(),
        });
        if self.selected != previous {
            self.send(ConductorMessage::ModelSelected {
                model_id: self.selected.clone(),
            });
        }
        Ok(())
    }

    /// Select a known model
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::NotFound`] for an unknown id; selection is
    /// unchanged.
    pub fn select(&mut self, id: &str) -> Result<(), ConductorError> {
        if !self.contains(id) {
            return Err(ConductorError::NotFound(id.to_string()));
        }
        if self.selected.as_deref() != Some(id) {
            self.selected = Some(id.to_string());
            tracing::info!(model_id = %id, "Model selected");
            self.send(ConductorMessage::ModelSelected {
                model_id: self.selected.clone(),
            });
        }
        Ok(())
    }

    /// Request that a model be loaded
    ///
    /// No-op if the model is already loaded or already loading.
    ///
    /// # Errors
    ///
    /// - [`ConductorError::Busy`] if a different model is loading
    /// - [`ConductorError::NotFound`] for an unknown id
    /// - [`ConductorError::Provider`] if the provider refuses the request;
    ///   the model is then marked failed
    pub fn load(&mut self, id: &str) -> Result<(), ConductorError> {
        if self.begin_load(id)? != LoadStep::Issue {
            return Ok(());
        }
        match self.provider.load_only(id) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_load(id, e)),
        }
    }

    /// Validate a load and mark the model loading
    ///
    /// Only [`LoadStep::Issue`] changes state; the caller must then call
    /// the provider's `load_only`.
    ///
    /// # Errors
    ///
    /// [`ConductorError::Busy`] or [`ConductorError::NotFound`], as for
    /// [`load`](Self::load).
    pub fn begin_load(&mut self, id: &str) -> Result<LoadStep, ConductorError> {
        if let Some(loading) = &self.loading {
            if loading == id {
                tracing::debug!(model_id = %id, "Load already in flight");
                return Ok(LoadStep::InFlight);
            }
            return Err(ConductorError::Busy {
                loading: loading.clone(),
            });
        }
        if !self.contains(id) {
            return Err(ConductorError::NotFound(id.to_string()));
        }
        if self.status(id) == LoadStatus::Loaded {
            tracing::debug!(model_id = %id, "Model already loaded");
            return Ok(LoadStep::Resident);
        }

        self.loading = Some(id.to_string());
        self.set_status(id, LoadStatus::Loading);
        tracing::info!(model_id = %id, "Model load requested");
        Ok(LoadStep::Issue)
    }

    /// The provider refused to load `id`
    ///
    /// Marks the model failed if it is still the one loading; an outcome
    /// event that already arrived wins. Returns the error for the caller.
    pub fn fail_load(&mut self, id: &str, error: ConductorError) -> ConductorError {
        let reason = error.to_string();
        tracing::warn!(model_id = %id, error = %reason, "Model load request failed");
        if self.loading.as_deref() == Some(id) {
            self.loading = None;
            self.set_status(id, LoadStatus::Failed(reason.clone()));
        }
        match error {
            ConductorError::Provider(_) => error,
            _ => ConductorError::Provider(reason),
        }
    }

    /// Handle `model_loaded(id)`
    ///
    /// Returns whether the event was applied.
    pub fn on_loaded(&mut self, id: &str) -> bool {
        if self.loading.as_deref() != Some(id) {
            tracing::debug!(model_id = %id, "Ignoring stale model_loaded");
            return false;
        }
        self.loading = None;

        // The engine holds a single model
        let others: Vec<String> = self
            .statuses
            .iter()
            .filter(|(other, status)| other.as_str() != id && **status == LoadStatus::Loaded)
            .map(|(other, _)| other.clone())
            .collect();
        for other in others {
            self.set_status(&other, LoadStatus::NotLoaded);
        }

        self.set_status(id, LoadStatus::Loaded);
        tracing::info!(model_id = %id, "Model loaded");
        true
    }

    /// Handle `model_load_error(id, reason)`
    ///
    /// Returns whether the event was applied.
    pub fn on_load_error(&mut self, id: &str, reason: &str) -> bool {
        if self.loading.as_deref() != Some(id) {
            tracing::debug!(model_id = %id, "Ignoring stale model_load_error");
            return false;
        }
        self.loading = None;
        self.set_status(id, LoadStatus::Failed(reason.to_string()));
        tracing::warn!(model_id = %id, reason = %reason, "Model load failed");
        true
    }

    /// Load status of a model
    #[must_use]
    pub fn status(&self, id: &str) -> LoadStatus {
        self.statuses.get(id).cloned().unwrap_or_default()
    }

    /// Selected model id
    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Model currently loading
    #[must_use]
    pub fn loading(&self) -> Option<&str> {
        self.loading.as_deref()
    }

    /// Known models
    #[must_use]
    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// The selected model, if it is loaded
    #[must_use]
    pub fn ready_model(&self) -> Option<&str> {
        self.selected
            .as_deref()
            .filter(|id| self.status(id) == LoadStatus::Loaded)
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            models: self.models.clone(),
            selected: self.selected.clone(),
            loading: self.loading.clone(),
            statuses: self.statuses.clone(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.models.iter().any(|m| m.id == id)
    }

    fn set_status(&mut self, id: &str, status: LoadStatus) {
        self.statuses.insert(id.to_string(), status.clone());
        self.send(ConductorMessage::ModelStatus {
            model_id: id.to_string(),
            status,
        });
    }

    fn send(&self, msg: ConductorMessage) {
        if self.tx.send(msg).is_err() {
            tracing::trace!("Message receiver closed");
        }
    }
}

impl std::fmt::Debug for ModelLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("models", &self.models.len())
            .field("selected", &self.selected)
            .field("loading", &self.loading)
            .finish_non_exhaustive()
    }
}
