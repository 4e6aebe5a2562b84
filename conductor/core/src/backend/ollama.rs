//! Ollama Backend Implementation
//!
//! Model provider and inference engine backed by a local Ollama server.
//!
//! # Ollama API
//!
//! - `/api/tags` - List available models
//! - `/api/generate` with an empty prompt - Load a model and keep it resident
//! - `/api/generate` with `stream: true` - Streamed generation (NDJSON)
//!
//! Requests run on spawned tokio tasks. Their outcomes are published on the
//! [`EventBus`] as tagged [`EngineEvent`]s, so callers never wait on the
//! network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::traits::{ChatRequest, InferenceEngine, ModelProvider};
use crate::bus::EventBus;
use crate::error::ConductorError;
use crate::events::EngineEvent;
use crate::messages::RequestId;
use crate::models::ModelDescriptor;

/// Default Ollama host
pub const DEFAULT_HOST: &str = "localhost";

/// Default Ollama port
pub const DEFAULT_PORT: u16 = 11434;

/// How long Ollama keeps a model resident after the last request
const KEEP_ALIVE: &str = "30m";

/// Generation currently streaming
struct ActiveChat {
    request_id: RequestId,
    handle: AbortHandle,
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
    /// Timeout for listing and load requests
    request_timeout: Duration,
    /// Where outcomes are published
    bus: EventBus,
    /// In-flight generation task
    active: Arc<Mutex<Option<ActiveChat>>>,
}

impl OllamaBackend {
    /// Create a new Ollama backend publishing on `bus`
    pub fn new(host: impl Into<String>, port: u16, bus: EventBus) -> Self {
        Self::with_timeout(host, port, bus, Duration::from_secs(120))
    }

    /// Create a backend with a custom timeout for listing and loading
    pub fn with_timeout(
        host: impl Into<String>,
        port: u16,
        bus: EventBus,
        request_timeout: Duration,
    ) -> Self {
        // Generation streams may outlive any fixed timeout, so only the
        // connect phase is bounded on the client itself
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            host: host.into(),
            port,
            http_client,
            request_timeout,
            bus,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Whether a generation task is running
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|chat| !chat.handle.is_finished())
    }

    async fn fetch_tags(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to reach Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama returned {status}: {body}");
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Invalid /api/tags response")?;
        Ok(tags.models.into_iter().map(ModelDescriptor::from).collect())
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, EventBus::new())
    }
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModelProvider for OllamaBackend {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ConductorError> {
        self.fetch_tags()
            .await
            .map_err(|e| ConductorError::Provider(format!("{e:#}")))
    }

    fn load_only(&self, model_id: &str) -> Result<(), ConductorError> {
        let runtime = Handle::try_current()
            .map_err(|e| ConductorError::Provider(format!("No async runtime: {e}")))?;

        let client = self.http_client.clone();
        let url = self.generate_url();
        let timeout = self.request_timeout;
        let bus = self.bus.clone();
        let model_id = model_id.to_string();
        let body = load_body(&model_id);

        runtime.spawn(async move {
            let result = post_load(&client, &url, &body, timeout).await;
            let event = match result {
                Ok(()) => EngineEvent::ModelLoaded { model_id },
                Err(e) => EngineEvent::ModelLoadError {
                    model_id,
                    reason: format!("{e:#}"),
                },
            };
            bus.emit(&event);
        });
        Ok(())
    }
}

impl InferenceEngine for OllamaBackend {
    fn start_chat(&self, request: ChatRequest) -> Result<(), ConductorError> {
        let runtime = Handle::try_current()
            .map_err(|e| ConductorError::Engine(format!("No async runtime: {e}")))?;

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            tracing::debug!(request_id = %previous.request_id, "Aborting superseded generation");
            previous.handle.abort();
        }

        let client = self.http_client.clone();
        let url = self.generate_url();
        let body = generate_body(&request);
        let bus = self.bus.clone();
        let slot = Arc::clone(&self.active);
        let request_id = request.request_id;

        let task = runtime.spawn(async move {
            let tag = Some(request_id);
            let event = match stream_generation(&client, &url, &body, request_id, &bus).await {
                Ok(()) => EngineEvent::ChatDone { request: tag },
                Err(e) => EngineEvent::ChatError {
                    request: tag,
                    reason: format!("{e:#}"),
                },
            };
            {
                let mut active = slot.lock();
                if active.as_ref().is_some_and(|chat| chat.request_id == request_id) {
                    *active = None;
                }
            }
            bus.emit(&event);
        });

        *active = Some(ActiveChat {
            request_id,
            handle: task.abort_handle(),
        });
        tracing::debug!(request_id = %request_id, model_id = %request.model_id, "Generation task spawned");
        Ok(())
    }

    fn stop_chat(&self) -> Result<(), ConductorError> {
        if let Some(chat) = self.active.lock().take() {
            chat.handle.abort();
            tracing::debug!(request_id = %chat.request_id, "Generation task aborted");
        }
        Ok(())
    }
}

/// Request body that loads a model without generating
fn load_body(model_id: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model_id,
        "prompt": "",
        "stream": false,
        "keep_alive": KEEP_ALIVE,
    })
}

/// Streaming generate request with the full sampling set
fn generate_body(request: &ChatRequest) -> serde_json::Value {
    let config = &request.config;
    serde_json::json!({
        "model": request.model_id,
        "prompt": request.prompt,
        "system": config.system_prompt,
        "stream": true,
        "keep_alive": KEEP_ALIVE,
        "options": {
            "temperature": config.temperature,
            "top_p": config.top_p,
            "top_k": config.top_k,
            "num_predict": config.max_tokens,
            "repeat_penalty": config.repeat_penalty,
            "repeat_last_n": config.repeat_last_n,
            "mirostat": config.mirostat.as_u8(),
            "mirostat_tau": config.mirostat_tau,
            "mirostat_eta": config.mirostat_eta,
        },
    })
}

async fn post_load(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    timeout: Duration,
) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .context("Failed to reach Ollama")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("Ollama returned {status}: {body}");
    }
    Ok(())
}

/// Stream NDJSON chunks, publishing each token as it arrives
async fn stream_generation(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    request_id: RequestId,
    bus: &EventBus,
) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("Failed to reach Ollama")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("Ollama returned {status}: {body}");
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.context("Stream interrupted")?;
        lines.push(&bytes);

        while let Some(line) = lines.next_line() {
            let Some(chunk) = parse_chunk(&line)? else {
                continue;
            };
            publish_token(bus, request_id, chunk.response);
            if chunk.done {
                return Ok(());
            }
        }
    }

    // Stream ended without done signal
    if let Some(chunk) = parse_chunk(&lines.into_rest())? {
        publish_token(bus, request_id, chunk.response);
    }
    Ok(())
}

fn publish_token(bus: &EventBus, request_id: RequestId, text: String) {
    if !text.is_empty() {
        bus.emit(&EngineEvent::ChatToken {
            request: Some(request_id),
            text,
        });
    }
}

/// Splits a byte stream into newline-terminated lines
///
/// Network chunks can end inside a multi-byte character, so bytes are only
/// decoded once a whole line is available.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line, newline included
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }

    /// Whatever followed the last newline
    fn into_rest(self) -> Vec<u8> {
        self.pending
    }
}

/// One NDJSON line of a streamed generate response
#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parse one line; blank and malformed lines yield `None`, server errors fail
fn parse_chunk(line: &[u8]) -> anyhow::Result<Option<GenerateChunk>> {
    let Ok(line) = std::str::from_utf8(line) else {
        tracing::debug!(bytes = line.len(), "Skipping stream line that is not UTF-8");
        return Ok(None);
    };
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Ok(chunk) = serde_json::from_str::<GenerateChunk>(line) else {
        tracing::debug!(line, "Skipping malformed stream line");
        return Ok(None);
    };
    if let Some(error) = chunk.error {
        bail!("{error}");
    }
    Ok(Some(chunk))
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    modified_at: Option<String>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Deserialize)]
struct TagDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

impl From<TagEntry> for ModelDescriptor {
    fn from(entry: TagEntry) -> Self {
        let display_name = match entry.details.and_then(|d| d.parameter_size) {
            Some(params) => format!("{} ({params})", entry.name),
            None => entry.name.clone(),
        };
        let modified_at = entry
            .modified_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        ModelDescriptor {
            filename: entry.model.unwrap_or_else(|| entry.name.clone()),
            filepath: String::new(),
            size_bytes: entry.size,
            modified_at,
            is_downloaded: true,
            display_name,
            id: entry.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{GenerationConfig, MirostatMode};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ollama_backend_creation() {
        let backend = OllamaBackend::new("localhost", 11434, EventBus::new());
        assert_eq!(backend.host, "localhost");
        assert_eq!(backend.port, 11434);
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(backend.tags_url(), "http://localhost:11434/api/tags");
        assert!(!backend.is_generating());
    }

    #[test]
    fn test_generate_body_carries_full_sampling_set() {
        let config = GenerationConfig {
            system_prompt: "Be brief.".to_string(),
            temperature: 1.3,
            top_k: 12,
            max_tokens: 512,
            mirostat: MirostatMode::V1,
            ..GenerationConfig::default()
        };
        let request = ChatRequest::new(RequestId::new(), "Hello", "llama3").with_config(config);
        let body = generate_body(&request);

        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "Hello");
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["temperature"], 1.3);
        assert_eq!(body["options"]["top_k"], 12);
        assert_eq!(body["options"]["num_predict"], 512);
        assert_eq!(body["options"]["repeat_last_n"], 192);
        assert_eq!(body["options"]["mirostat"], 1);
        assert_eq!(body["options"]["mirostat_tau"], 5.0);
    }

    #[test]
    fn test_load_body() {
        let body = load_body("llama3");
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "");
        assert_eq!(body["keep_alive"], KEEP_ALIVE);
    }

    #[test]
    fn test_parse_chunk() {
        let chunk = parse_chunk(br#"{"response":"Hi","done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.response, "Hi");
        assert!(!chunk.done);

        let last = parse_chunk(b"{\"response\":\"\",\"done\":true}\n")
            .unwrap()
            .unwrap();
        assert!(last.done);

        assert!(parse_chunk(b"   ").unwrap().is_none());
        assert!(parse_chunk(b"not json").unwrap().is_none());
        assert!(parse_chunk(b"{\"response\":\"\xC3\"}").unwrap().is_none());

        let err = parse_chunk(br#"{"error":"model not found"}"#).unwrap_err();
        assert_eq!(err.to_string(), "model not found");
    }

    #[test]
    fn test_line_buffer_joins_split_characters() {
        let text = "{\"response\":\"café\"}\n{\"done\":true}\n".as_bytes();
        // Cut between the two bytes of 'é'
        let cut = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut lines = LineBuffer::default();

        lines.push(&text[..cut]);
        assert_eq!(lines.next_line(), None);

        lines.push(&text[cut..]);
        let first = lines.next_line().unwrap();
        assert_eq!(parse_chunk(&first).unwrap().unwrap().response, "café");
        let second = lines.next_line().unwrap();
        assert!(parse_chunk(&second).unwrap().unwrap().done);
        assert_eq!(lines.next_line(), None);
        assert!(lines.into_rest().is_empty());
    }

    #[test]
    fn test_tags_to_descriptors() {
        let json = r#"{
            "models": [
                {
                    "name": "llama3:8b",
                    "model": "llama3:8b",
                    "size": 4661224676,
                    "modified_at": "2024-05-01T10:00:00Z",
                    "details": { "parameter_size": "8.0B" }
                },
                { "name": "tiny" }
            ]
        }"#;
        let tags: TagsResponse = serde_json::from_str(json).unwrap();
        let models: Vec<ModelDescriptor> = tags.models.into_iter().map(Into::into).collect();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "llama3:8b");
        assert_eq!(models[0].display_name, "llama3:8b (8.0B)");
        assert_eq!(models[0].size_bytes, 4_661_224_676);
        assert!(models[0].modified_at.is_some());
        assert_eq!(models[1].id, "tiny");
        assert_eq!(models[1].filename, "tiny");
        assert_eq!(models[1].modified_at, None);
    }

    #[test]
    fn test_requests_without_runtime_fail_synchronously() {
        let backend = OllamaBackend::default();
        let request = ChatRequest::new(RequestId::new(), "Hello", "llama3");
        assert!(matches!(
            backend.start_chat(request),
            Err(ConductorError::Engine(_))
        ));
        assert!(matches!(
            backend.load_only("llama3"),
            Err(ConductorError::Provider(_))
        ));
        assert!(backend.stop_chat().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_load_error() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = bus.subscribe(crate::events::EventName::ModelLoadError, move |event| {
            let _ = tx.send(event.clone());
        });

        // Port 9 (discard) is not an Ollama server
        let backend = OllamaBackend::with_timeout("127.0.0.1", 9, bus, Duration::from_secs(2));
        backend.load_only("llama3").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            EngineEvent::ModelLoadError { ref model_id, .. } if model_id == "llama3"
        ));
    }
}
