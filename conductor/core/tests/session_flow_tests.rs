//! Integration tests for the chat session flow
//!
//! These tests drive the Conductor the way a presentation layer would,
//! with test doubles standing in for the model provider and inference
//! engine. Engine output is simulated by emitting events on the bus.
//! Tests cover:
//! - Model refresh, selection and load gating
//! - Streaming, completion and error scenarios
//! - Stop and stale-event handling
//! - Subscription lifecycle across activation and teardown
//! - Generation parameter snapshots

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use localchat_core::{
    ChatRequest, Conductor, ConductorConfig, ConductorError, ConductorMessage, ConfigKey,
    EngineEvent, EventBus, EventName, InferenceEngine, LoadStatus, MessageReceiver, MessageRole,
    ModelDescriptor, ModelProvider, RequestId, SessionPhase, ValidationError,
};

// =============================================================================
// Test Doubles
// =============================================================================

#[derive(Default)]
struct FakeProvider {
    models: Mutex<Vec<ModelDescriptor>>,
    fail_listing: Mutex<bool>,
    load_requests: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelProvider for FakeProvider {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ConductorError> {
        if *self.fail_listing.lock() {
            return Err(ConductorError::Provider("provider offline".to_string()));
        }
        Ok(self.models.lock().clone())
    }

    fn load_only(&self, model_id: &str) -> Result<(), ConductorError> {
        self.load_requests.lock().push(model_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeEngine {
    requests: Mutex<Vec<ChatRequest>>,
    stops: Mutex<usize>,
}

impl InferenceEngine for FakeEngine {
    fn start_chat(&self, request: ChatRequest) -> Result<(), ConductorError> {
        self.requests.lock().push(request);
        Ok(())
    }

    fn stop_chat(&self) -> Result<(), ConductorError> {
        *self.stops.lock() += 1;
        Ok(())
    }
}

struct Harness {
    conductor: Conductor,
    bus: EventBus,
    provider: Arc<FakeProvider>,
    engine: Arc<FakeEngine>,
    rx: MessageReceiver,
}

impl Harness {
    fn new(model_ids: &[&str]) -> Self {
        let provider = Arc::new(FakeProvider::default());
        *provider.models.lock() = model_ids.iter().map(|id| ModelDescriptor::new(*id)).collect();
        let engine = Arc::new(FakeEngine::default());
        let bus = EventBus::new();
        let (tx, rx) = localchat_core::messages::channel();

        let mut conductor = Conductor::new(
            provider.clone(),
            engine.clone(),
            bus.clone(),
            ConductorConfig::default(),
            tx,
        );
        conductor.activate();

        Self {
            conductor,
            bus,
            provider,
            engine,
            rx,
        }
    }

    /// Refresh, then load and confirm the selected model
    async fn ready(model_ids: &[&str]) -> Self {
        let harness = Self::new(model_ids);
        harness.conductor.refresh().await.unwrap();
        let selected = harness.conductor.models_snapshot().selected.unwrap();
        harness.conductor.load(&selected).unwrap();
        harness.bus.emit(&EngineEvent::ModelLoaded {
            model_id: selected,
        });
        harness
    }

    fn token(&self, text: &str) {
        self.bus.emit(&EngineEvent::token(text));
    }

    fn tagged_token(&self, request: RequestId, text: &str) {
        self.bus.emit(&EngineEvent::ChatToken {
            request: Some(request),
            text: text.to_string(),
        });
    }

    fn transcript(&self) -> Vec<(MessageRole, String)> {
        self.conductor
            .conversation()
            .messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    fn assistant_text(&self) -> Option<String> {
        self.conductor
            .conversation()
            .last()
            .filter(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.clone())
    }

    fn drain(&mut self) -> Vec<ConductorMessage> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

fn user(text: &str) -> (MessageRole, String) {
    (MessageRole::User, text.to_string())
}

fn assistant(text: &str) -> (MessageRole, String) {
    (MessageRole::Assistant, text.to_string())
}

// =============================================================================
// Model Lifecycle
// =============================================================================

#[tokio::test]
async fn test_refresh_auto_selects_first_model() {
    let harness = Harness::new(&[]);
    harness.conductor.refresh().await.unwrap();
    assert_eq!(harness.conductor.models_snapshot().selected, None);

    *harness.provider.models.lock() = vec![ModelDescriptor::new("m1")];
    let models = harness.conductor.refresh().await.unwrap();

    assert_eq!(models.len(), 1);
    assert_eq!(
        harness.conductor.models_snapshot().selected,
        Some("m1".to_string())
    );
}

#[tokio::test]
async fn test_refresh_failure_keeps_previous_models() {
    let harness = Harness::new(&["m1", "m2"]);
    harness.conductor.refresh().await.unwrap();
    harness.conductor.select("m2").unwrap();

    *harness.provider.fail_listing.lock() = true;
    let err = harness.conductor.refresh().await.unwrap_err();

    assert!(matches!(err, ConductorError::Provider(_)));
    let snapshot = harness.conductor.models_snapshot();
    assert_eq!(snapshot.models.len(), 2);
    assert_eq!(snapshot.selected, Some("m2".to_string()));
}

#[tokio::test]
async fn test_start_requires_loaded_model() {
    let harness = Harness::new(&["m1"]);
    harness.conductor.refresh().await.unwrap();

    assert_eq!(
        harness.conductor.start("hello"),
        Err(ConductorError::NotReady)
    );

    harness.conductor.load("m1").unwrap();
    assert_eq!(
        harness.conductor.start("hello"),
        Err(ConductorError::NotReady)
    );
    assert!(harness.conductor.conversation().is_empty());
    assert!(harness.engine.requests.lock().is_empty());
}

#[tokio::test]
async fn test_load_events_arrive_through_bus() {
    let harness = Harness::new(&["m1", "m2"]);
    harness.conductor.refresh().await.unwrap();

    harness.conductor.load("m1").unwrap();
    assert_eq!(
        harness.conductor.load("m2"),
        Err(ConductorError::Busy {
            loading: "m1".to_string()
        })
    );
    assert_eq!(
        harness.conductor.models_snapshot().status("m1"),
        LoadStatus::Loading
    );

    // An outcome for a model that is not loading changes nothing
    harness.bus.emit(&EngineEvent::ModelLoaded {
        model_id: "m2".to_string(),
    });
    assert_eq!(
        harness.conductor.models_snapshot().status("m2"),
        LoadStatus::NotLoaded
    );

    harness.bus.emit(&EngineEvent::ModelLoaded {
        model_id: "m1".to_string(),
    });
    let snapshot = harness.conductor.models_snapshot();
    assert_eq!(snapshot.status("m1"), LoadStatus::Loaded);
    assert_eq!(snapshot.loading, None);
    assert_eq!(
        harness.provider.load_requests.lock().clone(),
        vec!["m1".to_string()]
    );
}

#[tokio::test]
async fn test_load_error_is_surfaced_and_recoverable() {
    let mut harness = Harness::new(&["m1"]);
    harness.conductor.refresh().await.unwrap();
    harness.drain();

    harness.conductor.load("m1").unwrap();
    harness.bus.emit(&EngineEvent::ModelLoadError {
        model_id: "m1".to_string(),
        reason: "not enough memory".to_string(),
    });

    assert_eq!(
        harness.conductor.models_snapshot().status("m1"),
        LoadStatus::Failed("not enough memory".to_string())
    );
    assert!(harness.drain().iter().any(|msg| matches!(
        msg,
        ConductorMessage::Notify { message, .. } if message.contains("not enough memory")
    )));

    // Retry is explicit and allowed
    harness.conductor.load("m1").unwrap();
    assert_eq!(harness.provider.load_requests.lock().len(), 2);
}

// =============================================================================
// Streaming Scenarios
// =============================================================================

#[tokio::test]
async fn test_hello_scenario() {
    let harness = Harness::ready(&["m1"]).await;

    harness.conductor.start("hello").unwrap();
    assert_eq!(harness.transcript(), vec![user("hello"), assistant("")]);
    assert_eq!(harness.conductor.phase(), SessionPhase::Generating);

    harness.token("Hi");
    assert_eq!(harness.assistant_text(), Some("Hi".to_string()));

    harness.token(" there");
    assert_eq!(harness.assistant_text(), Some("Hi there".to_string()));

    harness.bus.emit(&EngineEvent::done());
    assert_eq!(harness.conductor.phase(), SessionPhase::Idle);
    assert_eq!(harness.transcript(), vec![user("hello"), assistant("Hi there")]);

    let request = harness.engine.requests.lock()[0].clone();
    assert_eq!(request.prompt, "hello");
    assert_eq!(request.model_id, "m1");
}

#[tokio::test]
async fn test_tokens_concatenate_in_arrival_order() {
    let harness = Harness::ready(&["m1"]).await;
    let tokens = ["The", " quick", " brown", " fox", "", " 🦊", "\n", "end"];

    harness.conductor.start("story").unwrap();
    for token in tokens {
        harness.token(token);
    }

    assert_eq!(harness.assistant_text(), Some(tokens.concat()));
}

#[tokio::test]
async fn test_error_scenario_keeps_partial_output() {
    let harness = Harness::ready(&["m1"]).await;

    harness.conductor.start("x").unwrap();
    harness.token("par");
    harness.bus.emit(&EngineEvent::error("oom"));

    assert_eq!(harness.conductor.phase(), SessionPhase::Idle);
    assert_eq!(
        harness.conductor.last_error(),
        Some(ConductorError::Engine("oom".to_string()))
    );
    assert_eq!(harness.transcript(), vec![user("x"), assistant("par")]);

    // The session recovers
    harness.conductor.start("again").unwrap();
    assert_eq!(harness.conductor.phase(), SessionPhase::Generating);
    assert_eq!(harness.conductor.last_error(), None);
}

#[tokio::test]
async fn test_error_with_no_output_keeps_empty_message() {
    let harness = Harness::ready(&["m1"]).await;

    harness.conductor.start("x").unwrap();
    harness.bus.emit(&EngineEvent::error("oom"));

    assert_eq!(harness.transcript(), vec![user("x"), assistant("")]);
}

#[tokio::test]
async fn test_start_while_generating_leaves_conversation_unchanged() {
    let harness = Harness::ready(&["m1"]).await;

    harness.conductor.start("first").unwrap();
    harness.token("partial");
    let before = harness.conductor.conversation();

    assert_eq!(
        harness.conductor.start("second"),
        Err(ConductorError::AlreadyGenerating)
    );
    assert_eq!(harness.conductor.conversation(), before);
    assert_eq!(harness.engine.requests.lock().len(), 1);
}

#[tokio::test]
async fn test_empty_prompt_rejected_before_mutation() {
    let harness = Harness::ready(&["m1"]).await;

    assert_eq!(
        harness.conductor.start("  \t "),
        Err(ConductorError::Validation(ValidationError::EmptyPrompt))
    );
    assert!(harness.conductor.conversation().is_empty());
    assert_eq!(harness.conductor.phase(), SessionPhase::Idle);
}

// =============================================================================
// Stop and Stale Events
// =============================================================================

#[tokio::test]
async fn test_stop_then_late_events_leave_conversation_untouched() {
    let harness = Harness::ready(&["m1"]).await;

    let request = harness.conductor.start("x").unwrap();
    harness.tagged_token(request, "Hel");

    assert!(harness.conductor.stop());
    assert_eq!(*harness.engine.stops.lock(), 1);
    assert_eq!(harness.conductor.phase(), SessionPhase::Idle);
    let at_stop = harness.conductor.conversation();

    harness.tagged_token(request, "lo");
    harness.token("!");
    harness.bus.emit(&EngineEvent::ChatDone {
        request: Some(request),
    });
    harness.bus.emit(&EngineEvent::error("cancelled"));

    assert_eq!(harness.conductor.conversation(), at_stop);
    assert_eq!(harness.conductor.last_error(), None);
    assert!(!harness.conductor.stop());
}

#[tokio::test]
async fn test_stop_then_restart_does_not_leak_old_tokens() {
    let harness = Harness::ready(&["m1"]).await;

    let old = harness.conductor.start("first").unwrap();
    harness.conductor.stop();
    let new = harness.conductor.start("second").unwrap();

    harness.tagged_token(old, "stale");
    harness.bus.emit(&EngineEvent::ChatDone { request: Some(old) });
    assert_eq!(harness.conductor.phase(), SessionPhase::Generating);

    harness.tagged_token(new, "fresh");
    harness.bus.emit(&EngineEvent::ChatDone { request: Some(new) });

    assert_eq!(
        harness.transcript(),
        vec![
            user("first"),
            assistant(""),
            user("second"),
            assistant("fresh"),
        ]
    );
    assert_eq!(harness.conductor.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_done_twice_is_noop() {
    let mut harness = Harness::ready(&["m1"]).await;
    harness.conductor.start("x").unwrap();
    harness.token("a");
    harness.drain();

    harness.bus.emit(&EngineEvent::done());
    harness.bus.emit(&EngineEvent::done());

    let ends = harness
        .drain()
        .into_iter()
        .filter(|msg| matches!(msg, ConductorMessage::StreamEnd { .. }))
        .count();
    assert_eq!(ends, 1);
}

// =============================================================================
// Subscription Lifecycle
// =============================================================================

#[tokio::test]
async fn test_reactivation_does_not_double_fire() {
    let mut harness = Harness::ready(&["m1"]).await;

    assert_eq!(harness.conductor.deactivate(), 5);
    assert_eq!(harness.conductor.activate(), 5);
    assert_eq!(harness.conductor.activate(), 0);
    assert_eq!(harness.bus.handler_count(EventName::ChatToken), 1);

    harness.conductor.start("x").unwrap();
    harness.token("once");
    assert_eq!(harness.assistant_text(), Some("once".to_string()));
}

#[tokio::test]
async fn test_deactivated_conductor_hears_nothing() {
    let mut harness = Harness::ready(&["m1"]).await;
    harness.conductor.start("x").unwrap();

    harness.conductor.deactivate();
    assert_eq!(harness.bus.emit(&EngineEvent::token("lost")), 0);
    assert_eq!(harness.assistant_text(), Some(String::new()));
}

#[tokio::test]
async fn test_teardown_mid_generation_releases_handlers() {
    let harness = Harness::ready(&["m1"]).await;
    harness.conductor.start("x").unwrap();
    harness.token("partial");

    let Harness { conductor, bus, .. } = harness;
    drop(conductor);

    assert_eq!(bus.total_handlers(), 0);
    assert_eq!(bus.emit(&EngineEvent::token("late")), 0);
    assert_eq!(bus.emit(&EngineEvent::done()), 0);
}

// =============================================================================
// Generation Parameters
// =============================================================================

#[tokio::test]
async fn test_config_round_trip_and_rejection() {
    let mut harness = Harness::new(&["m1"]);

    harness.conductor.set_config(ConfigKey::Temperature, 1.3).unwrap();
    assert!((harness.conductor.config().temperature - 1.3).abs() < f64::EPSILON);
    assert_eq!(
        harness.drain(),
        vec![ConductorMessage::ConfigChanged {
            key: ConfigKey::Temperature
        }]
    );

    let err = harness
        .conductor
        .set_config(ConfigKey::Temperature, 5.0)
        .unwrap_err();
    assert!(err.is_validation());
    assert!((harness.conductor.config().temperature - 1.3).abs() < f64::EPSILON);
    assert!(harness.drain().is_empty());
}

#[tokio::test]
async fn test_in_flight_generation_keeps_its_config() {
    let harness = Harness::ready(&["m1"]).await;
    harness
        .conductor
        .set_config(ConfigKey::SystemPrompt, "Be brief.")
        .unwrap();

    harness.conductor.start("x").unwrap();
    harness
        .conductor
        .set_config(ConfigKey::SystemPrompt, "Be verbose.")
        .unwrap();
    harness.conductor.set_config(ConfigKey::MaxTokens, 256_u32).unwrap();

    let request = harness.engine.requests.lock()[0].clone();
    assert_eq!(request.config.system_prompt, "Be brief.");
    assert_eq!(request.config.max_tokens, 2048);
    assert_eq!(harness.conductor.config().system_prompt, "Be verbose.");
}

// =============================================================================
// Conversation Management
// =============================================================================

#[tokio::test]
async fn test_clear_conversation_only_when_idle() {
    let harness = Harness::ready(&["m1"]).await;
    harness.conductor.start("x").unwrap();

    assert_eq!(
        harness.conductor.clear_conversation(),
        Err(ConductorError::AlreadyGenerating)
    );

    harness.bus.emit(&EngineEvent::done());
    harness.conductor.clear_conversation().unwrap();
    assert!(harness.conductor.conversation().is_empty());
}

// =============================================================================
// Collaborators That Answer Inline
// =============================================================================

/// Provider and engine that publish their outcomes before returning
struct InlineBackend {
    bus: EventBus,
    stops: Mutex<usize>,
}

#[async_trait]
impl ModelProvider for InlineBackend {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ConductorError> {
        Ok(vec![ModelDescriptor::new("m1")])
    }

    fn load_only(&self, model_id: &str) -> Result<(), ConductorError> {
        self.bus.emit(&EngineEvent::ModelLoaded {
            model_id: model_id.to_string(),
        });
        Ok(())
    }
}

impl InferenceEngine for InlineBackend {
    fn start_chat(&self, request: ChatRequest) -> Result<(), ConductorError> {
        self.bus.emit(&EngineEvent::ChatToken {
            request: Some(request.request_id),
            text: "instant".to_string(),
        });
        Ok(())
    }

    fn stop_chat(&self) -> Result<(), ConductorError> {
        *self.stops.lock() += 1;
        self.bus.emit(&EngineEvent::done());
        Ok(())
    }
}

/// Run `f` on its own thread and fail if it does not return in time
fn within_deadline<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(std::time::Duration::from_secs(3))
        .expect("call did not return; a lock is held across a collaborator call")
}

#[tokio::test]
async fn test_collaborators_may_answer_inline() {
    let bus = EventBus::new();
    let backend = Arc::new(InlineBackend {
        bus: bus.clone(),
        stops: Mutex::new(0),
    });
    let (tx, _rx) = localchat_core::messages::channel();
    let mut conductor = Conductor::new(
        backend.clone(),
        backend.clone(),
        bus,
        ConductorConfig::default(),
        tx,
    );
    conductor.activate();
    conductor.refresh().await.unwrap();
    let conductor = Arc::new(conductor);

    let c = conductor.clone();
    within_deadline(move || c.load("m1")).unwrap();
    assert_eq!(conductor.models_snapshot().status("m1"), LoadStatus::Loaded);

    let c = conductor.clone();
    within_deadline(move || c.start("hi")).unwrap();
    assert_eq!(conductor.phase(), SessionPhase::Generating);

    let c = conductor.clone();
    assert!(within_deadline(move || c.stop()));
    assert_eq!(*backend.stops.lock(), 1);
    assert_eq!(conductor.phase(), SessionPhase::Idle);
    let reply = conductor.conversation().last().cloned().unwrap();
    assert_eq!(reply.role, MessageRole::Assistant);
    assert_eq!(reply.content, "instant");
    assert!(!reply.streaming);
}

// =============================================================================
// Ollama Streaming
// =============================================================================

/// Answer one HTTP request with a chunked NDJSON body split at `cut`
async fn serve_split_stream(listener: tokio::net::TcpListener, body: Vec<u8>, cut: usize) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut socket, _) = listener.accept().await.unwrap();

    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        request.extend_from_slice(&buf[..n]);
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map_or(0, |value| value.trim().parse().unwrap());
    while request.len() < header_end + length {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed mid-request");
        request.extend_from_slice(&buf[..n]);
    }

    socket
        .write_all(
            b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\n\
              transfer-encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
    for part in [&body[..cut], &body[cut..]] {
        socket
            .write_all(format!("{:x}\r\n", part.len()).as_bytes())
            .await
            .unwrap();
        socket.write_all(part).await.unwrap();
        socket.write_all(b"\r\n").await.unwrap();
        socket.flush().await.unwrap();
        // Keep the halves in separate reads on the client
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    socket.write_all(b"0\r\n\r\n").await.unwrap();
    socket.flush().await.unwrap();
}

#[tokio::test]
async fn test_streamed_reply_survives_split_characters() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = concat!(
        "{\"response\":\"café\",\"done\":false}\n",
        "{\"response\":\" ☕\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":true}\n",
    )
    .as_bytes()
    .to_vec();
    // Cut between the two bytes of 'é'
    let cut = body.iter().position(|b| *b == 0xC3).unwrap() + 1;
    let server = tokio::spawn(serve_split_stream(listener, body, cut));

    let provider = Arc::new(FakeProvider::default());
    *provider.models.lock() = vec![ModelDescriptor::new("m1")];
    let bus = EventBus::new();
    let engine = Arc::new(localchat_core::OllamaBackend::new(
        "127.0.0.1",
        port,
        bus.clone(),
    ));
    let (tx, _rx) = localchat_core::messages::channel();
    let mut conductor = Conductor::new(
        provider,
        engine,
        bus.clone(),
        ConductorConfig::default(),
        tx,
    );
    conductor.activate();
    conductor.refresh().await.unwrap();
    conductor.load("m1").unwrap();
    bus.emit(&EngineEvent::ModelLoaded {
        model_id: "m1".to_string(),
    });

    conductor.start("hi").unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while conductor.phase() == SessionPhase::Generating {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    server.await.unwrap();

    assert_eq!(conductor.last_error(), None);
    let reply = conductor.conversation().last().cloned().unwrap();
    assert_eq!(reply.content, "café ☕");
}
