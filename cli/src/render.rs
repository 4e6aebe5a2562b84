//! Terminal rendering of conductor messages and snapshots

use std::fmt::Write as _;

use localchat_core::{
    ConductorMessage, ConfigKey, GenerationConfig, LoadStatus, ModelSnapshot, NotifyLevel,
};

/// Where and how a message is written
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rendered {
    /// Streamed text, written to stdout without a newline
    Inline(String),
    /// A full line on stdout
    Line(String),
    /// A status line on stderr
    Status(String),
}

/// Render one message, or `None` if it needs no output
#[must_use]
pub fn render(msg: &ConductorMessage) -> Option<Rendered> {
    match msg {
        ConductorMessage::StreamStart { model_id, .. } => {
            Some(Rendered::Inline(format!("[{model_id}] ")))
        }
        ConductorMessage::Token { text, .. } => Some(Rendered::Inline(text.clone())),
        ConductorMessage::StreamEnd { .. } => Some(Rendered::Line(String::new())),
        ConductorMessage::StreamError { error, .. } => {
            Some(Rendered::Line(format!("\n[error: {error}]")))
        }
        ConductorMessage::StreamStopped { .. } => Some(Rendered::Line("\n[stopped]".to_string())),
        ConductorMessage::ModelSelected {
            model_id: Some(model_id),
        } => Some(Rendered::Status(format!("Selected {model_id}"))),
        ConductorMessage::ModelStatus { model_id, status } => match status {
            LoadStatus::Loading => Some(Rendered::Status(format!("Loading {model_id}..."))),
            LoadStatus::Loaded => Some(Rendered::Status(format!("{model_id} is ready"))),
            LoadStatus::Failed(_) | LoadStatus::NotLoaded => None,
        },
        ConductorMessage::ConversationCleared => {
            Some(Rendered::Status("Conversation cleared".to_string()))
        }
        ConductorMessage::Notify { level, message } => {
            let prefix = match level {
                NotifyLevel::Info => "",
                NotifyLevel::Warning => "warning: ",
                NotifyLevel::Error => "error: ",
            };
            Some(Rendered::Status(format!("{prefix}{message}")))
        }
        ConductorMessage::Message { .. }
        | ConductorMessage::Phase { .. }
        | ConductorMessage::ModelsRefreshed { .. }
        | ConductorMessage::ModelSelected { model_id: None }
        | ConductorMessage::ConfigChanged { .. } => None,
    }
}

/// Model table for `/models` and the `models` subcommand
#[must_use]
pub fn format_models(snapshot: &ModelSnapshot) -> String {
    if snapshot.models.is_empty() {
        return "No models available".to_string();
    }
    let width = snapshot
        .models
        .iter()
        .map(|m| m.id.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for model in &snapshot.models {
        let marker = if snapshot.selected.as_deref() == Some(model.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let status = match snapshot.status(&model.id) {
            LoadStatus::Failed(reason) => format!("failed: {reason}"),
            other => other.label().to_string(),
        };
        let _ = writeln!(
            out,
            "{marker} {:<width$}  {:>9}  {status}",
            model.id,
            format_size(model.size_bytes),
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// Generation parameters for `/config`
#[must_use]
pub fn format_config(config: &GenerationConfig) -> String {
    ConfigKey::ALL
        .iter()
        .map(|key| format!("{:<14} {}", key.as_str(), config.value(*key)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.1} GB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.0} MB", bytes / MIB)
    } else if bytes > 0.0 {
        "<1 MB".to_string()
    } else {
        "-".to_string()
    }
}
