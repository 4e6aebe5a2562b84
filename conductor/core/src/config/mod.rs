//! Application settings
//!
//! localchat reads its settings from `config.toml` under the user's config
//! directory (`$XDG_CONFIG_HOME/localchat/`, usually `~/.config/localchat/`),
//! then lets environment variables and command-line flags override them.
//!
//! # Precedence
//!
//! Command-line flags beat environment variables, which beat the file,
//! which beats the built-in defaults. [`LocalChatConfig::source`] reports
//! the strongest layer that changed anything.
//!
//! # File Layout
//!
//! ```toml
//! [backend]
//! host = "localhost"
//! port = 11434
//! request_timeout_secs = 120
//!
//! [generation]
//! system_prompt = "You are a helpful, precise assistant."
//! temperature = 0.7
//! top_p = 0.9
//! top_k = 40
//! max_tokens = 2048
//! repeat_penalty = 1.1
//! repeat_last_n = 192
//! mirostat = 2
//! mirostat_tau = 5.0
//! mirostat_eta = 0.1
//!
//! [session]
//! default_model = "llama3.2"
//! auto_load = true
//! max_prompt_chars = 32768
//! ```
//!
//! `[generation]` values pass the same range checks as `/set`; an
//! out-of-range value fails the load rather than being clamped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{DEFAULT_HOST, DEFAULT_PORT};
use crate::conductor::ConductorConfig;
use crate::generation::{ConfigKey, ConfigValue, GenerationConfig};
use crate::session::DEFAULT_MAX_PROMPT_CHARS;

/// Default timeout for listing and load requests
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read
    #[error("Cannot read settings file {path}: {source}")]
    ReadError {
        /// File that failed
        path: PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this layout
    #[error("Malformed settings file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range or otherwise unusable
    #[error("Bad setting {0}")]
    ValidationError(String),
}

/// Strongest layer that contributed to a [`LocalChatConfig`]
///
/// Ordered weakest first, so layers compare by precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Built-in defaults only
    Default,
    /// Settings file
    File,
    /// Environment variables
    Env,
    /// Command-line flags
    Cli,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Default => "built-in defaults",
            Self::File => "settings file",
            Self::Env => "environment",
            Self::Cli => "command line",
        })
    }
}

/// `[backend]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub host: Option<String>,
    /// Ollama port
    pub port: Option<u16>,
    /// Timeout for listing and load requests, in seconds
    pub request_timeout_secs: Option<u64>,
}

/// `[generation]` table, snake_case names of the generation parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct GenerationToml {
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub max_tokens: Option<i64>,
    pub repeat_penalty: Option<f64>,
    pub repeat_last_n: Option<i64>,
    pub mirostat: Option<i64>,
    pub mirostat_tau: Option<f64>,
    pub mirostat_eta: Option<f64>,
}

impl GenerationToml {
    /// Present entries as typed parameter edits
    fn entries(&self) -> Vec<(ConfigKey, ConfigValue)> {
        let text = self
            .system_prompt
            .clone()
            .map(|prompt| (ConfigKey::SystemPrompt, ConfigValue::Text(prompt)));
        let floats = [
            (ConfigKey::Temperature, self.temperature),
            (ConfigKey::TopP, self.top_p),
            (ConfigKey::RepeatPenalty, self.repeat_penalty),
            (ConfigKey::MirostatTau, self.mirostat_tau),
            (ConfigKey::MirostatEta, self.mirostat_eta),
        ]
        .into_iter()
        .filter_map(|(key, v)| v.map(|v| (key, ConfigValue::Float(v))));
        let ints = [
            (ConfigKey::TopK, self.top_k),
            (ConfigKey::MaxTokens, self.max_tokens),
            (ConfigKey::RepeatLastN, self.repeat_last_n),
            (ConfigKey::Mirostat, self.mirostat),
        ]
        .into_iter()
        .filter_map(|(key, v)| v.map(|v| (key, ConfigValue::Integer(v))));

        text.into_iter().chain(floats).chain(ints).collect()
    }
}

/// `[session]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Model to select at startup
    pub default_model: Option<String>,
    /// Load the startup model without being asked
    pub auto_load: Option<bool>,
    /// Prompt length limit, in characters
    pub max_prompt_chars: Option<usize>,
}

/// Whole settings file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalChatToml {
    /// `[backend]`
    pub backend: BackendToml,
    /// `[generation]`
    pub generation: GenerationToml,
    /// `[session]`
    pub session: SessionToml,
}

/// Resolved localchat settings
///
/// Build with [`load_config`], then apply [`ConfigOverrides`] from the
/// command line.
#[derive(Clone, Debug)]
pub struct LocalChatConfig {
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Timeout for listing and load requests
    pub request_timeout: Duration,
    /// Starting generation parameters
    pub generation: GenerationConfig,
    /// Model to select at startup
    pub default_model: Option<String>,
    /// Load the startup model without being asked
    pub auto_load: bool,
    /// Prompt length limit, in characters
    pub max_prompt_chars: usize,
    /// Settings file that was read, if one existed
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for LocalChatConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            generation: GenerationConfig::default(),
            default_model: None,
            auto_load: false,
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl LocalChatConfig {
    /// Built-in defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strongest layer that changed anything
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Overwrite the recorded source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Record that `layer` changed a value
    fn touched_by(&mut self, layer: ConfigSource) {
        self.source = self.source.max(layer);
    }

    /// Settings for the [`Conductor`](crate::conductor::Conductor)
    #[must_use]
    pub fn conductor_config(&self) -> ConductorConfig {
        ConductorConfig {
            generation: self.generation.clone(),
            max_prompt_chars: self.max_prompt_chars,
        }
    }
}

/// `$XDG_CONFIG_HOME/localchat/config.toml`, if a config directory exists
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("localchat").join("config.toml"))
}

/// Load settings from the default file and the environment
///
/// # Errors
///
/// Fails if the file exists but cannot be read, parsed or validated. A
/// missing file just means defaults.
pub fn load_config() -> Result<LocalChatConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load settings from `path` (if given and present) and the environment
///
/// # Errors
///
/// Fails if the file exists but cannot be read, parsed or validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<LocalChatConfig, ConfigError> {
    let mut config = LocalChatConfig::default();

    match path {
        Some(path) if path.exists() => {
            let file = read_toml(&path)?;
            apply_file(&mut config, &file)?;
            tracing::info!(path = %path.display(), "Read settings file");
            config.config_file_path = Some(path);
        }
        Some(path) => {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
        }
        None => {}
    }

    apply_env(&mut config);
    Ok(config)
}

fn read_toml(path: &Path) -> Result<LocalChatToml, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn apply_file(config: &mut LocalChatConfig, file: &LocalChatToml) -> Result<(), ConfigError> {
    let backend = &file.backend;
    if let Some(host) = &backend.host {
        config.host.clone_from(host);
    }
    if let Some(port) = backend.port {
        config.port = port;
    }
    if let Some(secs) = backend.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }

    for (key, value) in file.generation.entries() {
        config.generation = config
            .generation
            .with(key, value)
            .map_err(|e| ConfigError::ValidationError(format!("in [generation]: {e}")))?;
    }

    let session = &file.session;
    if let Some(model) = &session.default_model {
        config.default_model = Some(model.clone());
    }
    if let Some(auto_load) = session.auto_load {
        config.auto_load = auto_load;
    }
    match session.max_prompt_chars {
        Some(0) => {
            return Err(ConfigError::ValidationError(
                "in [session]: max_prompt_chars must be at least 1".to_string(),
            ))
        }
        Some(max) => config.max_prompt_chars = max,
        None => {}
    }

    config.touched_by(ConfigSource::File);
    Ok(())
}

/// First of `names` that is set
fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

/// Split `host`, `host:port` or `http://host:port/` into its parts
fn parse_host(value: &str) -> (String, Option<u16>) {
    let bare = value
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    if let Some((host, port)) = bare.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), Some(port));
        }
    }
    (bare.to_string(), None)
}

fn apply_env(config: &mut LocalChatConfig) {
    if let Some(value) = env_first(&["LOCALCHAT_HOST", "OLLAMA_HOST"]) {
        let (host, port) = parse_host(&value);
        if !host.is_empty() {
            config.host = host;
            config.touched_by(ConfigSource::Env);
        }
        if let Some(port) = port {
            config.port = port;
            config.touched_by(ConfigSource::Env);
        }
    }
    if let Some(value) = env_first(&["LOCALCHAT_PORT", "OLLAMA_PORT"]) {
        match value.parse::<u16>() {
            Ok(port) => {
                config.port = port;
                config.touched_by(ConfigSource::Env);
            }
            Err(e) => tracing::warn!(value = %value, error = %e, "Ignoring port from environment"),
        }
    }
    if let Some(model) = env_first(&["LOCALCHAT_MODEL"]) {
        config.default_model = Some(model);
        config.touched_by(ConfigSource::Env);
    }
    if let Some(prompt) = env_first(&["LOCALCHAT_SYSTEM_PROMPT"]) {
        config.generation.system_prompt = prompt;
        config.touched_by(ConfigSource::Env);
    }
    if let Some(value) = env_first(&["LOCALCHAT_TEMPERATURE"]) {
        let parsed = ConfigValue::parse_for(ConfigKey::Temperature, &value)
            .and_then(|t| config.generation.with(ConfigKey::Temperature, t));
        match parsed {
            Ok(generation) => {
                config.generation = generation;
                config.touched_by(ConfigSource::Env);
            }
            Err(e) => {
                tracing::warn!(value = %value, error = %e, "Ignoring LOCALCHAT_TEMPERATURE");
            }
        }
    }
}

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--model`
    pub default_model: Option<String>,
    /// `--load`
    pub auto_load: Option<bool>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the host
    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Override the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Override the startup model
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Override startup loading
    #[must_use]
    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = Some(auto_load);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.default_model.is_none()
            && self.auto_load.is_none()
    }

    /// Write the overrides into `config`
    pub fn apply(&self, config: &mut LocalChatConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = &self.default_model {
            config.default_model = Some(model.clone());
        }
        if let Some(auto_load) = self.auto_load {
            config.auto_load = auto_load;
        }
        config.touched_by(ConfigSource::Cli);
    }
}
