//! Generation Parameters
//!
//! Sampling knobs and system prompt sent with every generation request,
//! plus the [`ConfigStore`] that holds the current values.
//!
//! # Validation Policy
//!
//! Out-of-range values are rejected with [`ValidationError::OutOfRange`],
//! never clamped. The same rule applies to every numeric field. A rejected
//! `set` leaves the store untouched.
//!
//! # Snapshots
//!
//! The store is copy-on-write: `set` builds a complete new
//! [`GenerationConfig`] and swaps it in. Readers holding an earlier
//! snapshot (an in-flight generation, for instance) keep seeing it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, precise assistant. Do not repeat words or characters.";

/// Mirostat sampling mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirostatMode {
    /// Mirostat off
    Disabled,
    /// Mirostat v1
    V1,
    /// Mirostat v2
    #[default]
    V2,
}

impl MirostatMode {
    /// Numeric mode as understood by llama.cpp based engines
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

/// Generation parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// System prompt prepended to every request
    pub system_prompt: String,
    /// Sampling temperature, [0, 2]
    pub temperature: f64,
    /// Nucleus sampling threshold, [0, 1]
    pub top_p: f64,
    /// Top-k sampling, [0, 100]
    pub top_k: u32,
    /// Maximum tokens to generate, [128, 4096]
    pub max_tokens: u32,
    /// Repetition penalty, [1.0, 2.0]
    pub repeat_penalty: f64,
    /// Window for the repetition penalty, [0, 4096]
    pub repeat_last_n: u32,
    /// Mirostat mode
    pub mirostat: MirostatMode,
    /// Mirostat target entropy, [0, 10]
    pub mirostat_tau: f64,
    /// Mirostat learning rate, [0, 1]
    pub mirostat_eta: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
            repeat_penalty: 1.1,
            repeat_last_n: 192,
            mirostat: MirostatMode::V2,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
        }
    }
}

impl GenerationConfig {
    /// Return a copy with one field replaced
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the value has the wrong kind or is
    /// outside the field's range. `self` is never modified.
    pub fn with(&self, key: ConfigKey, value: ConfigValue) -> Result<Self, ValidationError> {
        let mut next = self.clone();
        match key {
            ConfigKey::SystemPrompt => next.system_prompt = value.into_text(key)?,
            ConfigKey::Temperature => next.temperature = value.float_in(key, 0.0, 2.0)?,
            ConfigKey::TopP => next.top_p = value.float_in(key, 0.0, 1.0)?,
            ConfigKey::TopK => next.top_k = value.int_in(key, 0, 100)?,
            ConfigKey::MaxTokens => next.max_tokens = value.int_in(key, 128, 4096)?,
            ConfigKey::RepeatPenalty => next.repeat_penalty = value.float_in(key, 1.0, 2.0)?,
            ConfigKey::RepeatLastN => next.repeat_last_n = value.int_in(key, 0, 4096)?,
            ConfigKey::Mirostat => {
                let mode = value.int_in(key, 0, 2)?;
                next.mirostat = MirostatMode::from_i64(i64::from(mode)).unwrap_or_default();
            }
            ConfigKey::MirostatTau => next.mirostat_tau = value.float_in(key, 0.0, 10.0)?,
            ConfigKey::MirostatEta => next.mirostat_eta = value.float_in(key, 0.0, 1.0)?,
        }
        Ok(next)
    }

    /// Current value of a field
    #[must_use]
    pub fn value(&self, key: ConfigKey) -> ConfigValue {
        match key {
            ConfigKey::SystemPrompt => ConfigValue::Text(self.system_prompt.clone()),
            ConfigKey::Temperature => ConfigValue::Float(self.temperature),
            ConfigKey::TopP => ConfigValue::Float(self.top_p),
            ConfigKey::TopK => ConfigValue::Integer(i64::from(self.top_k)),
            ConfigKey::MaxTokens => ConfigValue::Integer(i64::from(self.max_tokens)),
            ConfigKey::RepeatPenalty => ConfigValue::Float(self.repeat_penalty),
            ConfigKey::RepeatLastN => ConfigValue::Integer(i64::from(self.repeat_last_n)),
            ConfigKey::Mirostat => ConfigValue::Integer(i64::from(self.mirostat.as_u8())),
            ConfigKey::MirostatTau => ConfigValue::Float(self.mirostat_tau),
            ConfigKey::MirostatEta => ConfigValue::Float(self.mirostat_eta),
        }
    }
}

/// Name of a generation parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    /// `systemPrompt`
    SystemPrompt,
    /// `temperature`
    Temperature,
    /// `topP`
    TopP,
    /// `topK`
    TopK,
    /// `maxTokens`
    MaxTokens,
    /// `repeatPenalty`
    RepeatPenalty,
    /// `repeatLastN`
    RepeatLastN,
    /// `mirostat`
    Mirostat,
    /// `mirostatTau`
    MirostatTau,
    /// `mirostatEta`
    MirostatEta,
}

impl ConfigKey {
    /// All keys in display order
    pub const ALL: [Self; 10] = [
        Self::SystemPrompt,
        Self::Temperature,
        Self::TopP,
        Self::TopK,
        Self::MaxTokens,
        Self::RepeatPenalty,
        Self::RepeatLastN,
        Self::Mirostat,
        Self::MirostatTau,
        Self::MirostatEta,
    ];

    /// Canonical (camelCase) name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemPrompt => "systemPrompt",
            Self::Temperature => "temperature",
            Self::TopP => "topP",
            Self::TopK => "topK",
            Self::MaxTokens => "maxTokens",
            Self::RepeatPenalty => "repeatPenalty",
            Self::RepeatLastN => "repeatLastN",
            Self::Mirostat => "mirostat",
            Self::MirostatTau => "mirostatTau",
            Self::MirostatEta => "mirostatEta",
        }
    }

    /// Whether the field holds a number
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::SystemPrompt)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ValidationError;

    /// Accepts camelCase and snake_case, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().to_lowercase() == normalized)
            .ok_or_else(|| ValidationError::UnknownKey(s.to_string()))
    }
}

/// A value to assign to a generation parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Text (system prompt)
    Text(String),
    /// Whole number
    Integer(i64),
    /// Real number
    Float(f64),
}

impl ConfigValue {
    /// Parse user input for a given key
    ///
    /// Numeric keys parse as integers first, then as floats; the system
    /// prompt takes the input verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::WrongType`] if a numeric key gets input
    /// that is not a number.
    pub fn parse_for(key: ConfigKey, input: &str) -> Result<Self, ValidationError> {
        if !key.is_numeric() {
            return Ok(Self::Text(input.to_string()));
        }
        let trimmed = input.trim();
        if let Ok(int) = trimmed.parse::<i64>() {
            return Ok(Self::Integer(int));
        }
        trimmed
            .parse::<f64>()
            .map(Self::Float)
            .map_err(|_| ValidationError::WrongType {
                key: key.as_str(),
                expected: "a number",
            })
    }

    fn into_text(self, key: ConfigKey) -> Result<String, ValidationError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Integer(_) | Self::Float(_) => Err(ValidationError::WrongType {
                key: key.as_str(),
                expected: "text",
            }),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn float_in(self, key: ConfigKey, min: f64, max: f64) -> Result<f64, ValidationError> {
        let value = match self {
            Self::Float(v) => v,
            Self::Integer(v) => v as f64,
            Self::Text(_) => {
                return Err(ValidationError::WrongType {
                    key: key.as_str(),
                    expected: "a number",
                })
            }
        };
        if !value.is_finite() || value < min || value > max {
            return Err(ValidationError::OutOfRange {
                key: key.as_str(),
                min,
                max,
                value,
            });
        }
        Ok(value)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn int_in(self, key: ConfigKey, min: u32, max: u32) -> Result<u32, ValidationError> {
        let value = match self {
            Self::Integer(v) => v,
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => v as i64,
            Self::Float(_) | Self::Text(_) => {
                return Err(ValidationError::WrongType {
                    key: key.as_str(),
                    expected: "a whole number",
                })
            }
        };
        if value < i64::from(min) || value > i64::from(max) {
            return Err(ValidationError::OutOfRange {
                key: key.as_str(),
                min: f64::from(min),
                max: f64::from(max),
                value: value as f64,
            });
        }
        u32::try_from(value).map_err(|_| ValidationError::OutOfRange {
            key: key.as_str(),
            min: f64::from(min),
            max: f64::from(max),
            value: value as f64,
        })
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

/// Holder of the current [`GenerationConfig`]
///
/// Clones share the same underlying value.
#[derive(Clone, Debug, Default)]
pub struct ConfigStore {
    current: Arc<RwLock<Arc<GenerationConfig>>>,
}

impl ConfigStore {
    /// Create a store holding `config`
    #[must_use]
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn get(&self) -> Arc<GenerationConfig> {
        Arc::clone(&self.current.read())
    }

    /// Validate and replace one field
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`]; the stored config is unchanged.
    pub fn set(
        &self,
        key: ConfigKey,
        value: impl Into<ConfigValue>,
    ) -> Result<Arc<GenerationConfig>, ValidationError> {
        let mut current = self.current.write();
        let next = Arc::new(current.with(key, value.into())?);
        *current = Arc::clone(&next);
        tracing::debug!(key = %key, value = %next.value(key), "Generation config updated");
        Ok(next)
    }

    /// Replace the whole config
    pub fn replace(&self, config: GenerationConfig) {
        *self.current.write() = Arc::new(config);
    }
}
