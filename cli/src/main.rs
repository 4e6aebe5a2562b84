//! localchat
//!
//! Terminal chat client for models served by a local Ollama instance.
//!
//! # Usage
//!
//! ```bash
//! # Chat with the first available model, loading it on startup
//! localchat --load
//!
//! # Pick a model and server
//! localchat --host gpu-box --port 11434 --model llama3.2 --load
//!
//! # List models and exit
//! localchat models
//!
//! # With verbose logging
//! RUST_LOG=debug localchat
//! ```
//!
//! # Environment Variables
//!
//! - `LOCALCHAT_HOST` / `OLLAMA_HOST`: Ollama server host (default: localhost)
//! - `LOCALCHAT_PORT` / `OLLAMA_PORT`: Ollama server port (default: 11434)
//! - `LOCALCHAT_MODEL`: Model to select on startup
//! - `LOCALCHAT_SYSTEM_PROMPT`, `LOCALCHAT_TEMPERATURE`: Generation defaults
//! - `RUST_LOG`: Log filter (logs go to stderr)
//!
//! # Files
//!
//! - Config: `$XDG_CONFIG_HOME/localchat/config.toml`

mod render;
mod repl;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use localchat_core::{
    load_config, load_config_from_path, messages, Conductor, ConductorError, ConductorMessage,
    ConfigOverrides, EventBus, LocalChatConfig, MessageReceiver, OllamaBackend,
};

use crate::render::{format_config, format_models, render, Rendered};
use crate::repl::{Command, Input, HELP};

/// Chat with local language models
#[derive(Debug, Parser)]
#[command(name = "localchat", version, about)]
struct Args {
    /// Ollama server host
    #[arg(long)]
    host: Option<String>,

    /// Ollama server port
    #[arg(long)]
    port: Option<u16>,

    /// Config file (default: $XDG_CONFIG_HOME/localchat/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Model to select on startup
    #[arg(long, short)]
    model: Option<String>,

    /// Load the selected model on startup
    #[arg(long)]
    load: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "LOCALCHAT_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Interactive chat (default)
    Chat,
    /// List available models and exit
    Models,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref host) = self.host {
            overrides = overrides.with_host(host.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_default_model(model.clone());
        }
        if self.load {
            overrides = overrides.with_auto_load(true);
        }
        overrides
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new("warn")
            .add_directive(format!("localchat={level}").parse()?)
            .add_directive(format!("localchat_core={level}").parse()?),
    };
    // stdout carries the streamed reply
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
    Ok(())
}

fn load_settings(args: &Args) -> anyhow::Result<LocalChatConfig> {
    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone()))
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config().context("Failed to load config")?,
    };
    args.overrides().apply(&mut config);
    info!(
        host = %config.host,
        port = config.port,
        source = %config.source(),
        "Configuration loaded"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;
    let config = load_settings(&args)?;

    let bus = EventBus::new();
    let backend = Arc::new(OllamaBackend::with_timeout(
        config.host.clone(),
        config.port,
        bus.clone(),
        config.request_timeout,
    ));
    let (tx, rx) = messages::channel();
    let mut conductor = Conductor::new(
        backend.clone(),
        backend,
        bus,
        config.conductor_config(),
        tx,
    );
    conductor.activate();

    match args.command {
        Some(Mode::Models) => list_models(&conductor).await,
        Some(Mode::Chat) | None => chat(conductor, &config, rx).await,
    }
}

async fn list_models(conductor: &Conductor) -> anyhow::Result<()> {
    conductor
        .refresh()
        .await
        .context("Could not list models")?;
    println!("{}", format_models(&conductor.models_snapshot()));
    Ok(())
}

/// How long queued output may take to flush on exit
const PRINTER_DRAIN: Duration = Duration::from_secs(1);

async fn chat(
    conductor: Conductor,
    config: &LocalChatConfig,
    rx: MessageReceiver,
) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_messages(rx));

    startup(&conductor, config).await;
    eprintln!("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                match repl::parse(&line) {
                    Ok(Input::Empty) => {}
                    Ok(Input::Prompt(prompt)) => report(conductor.start(&prompt).map(|_| ())),
                    Ok(Input::Command(Command::Quit)) => break,
                    Ok(Input::Command(command)) => run_command(&conductor, command).await,
                    Err(e) => eprintln!("{e}"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if !conductor.stop() {
                    break;
                }
            }
        }
    }

    shutdown(conductor, printer).await;
    debug!("Chat loop finished");
    Ok(())
}

/// Stop any generation and let the printer write what is queued
async fn shutdown<T>(conductor: Conductor, printer: JoinHandle<T>) -> Option<T> {
    conductor.stop();
    // Dropping the Conductor disposes its handlers and closes the channel,
    // so the printer ends once it has written everything queued
    drop(conductor);
    match tokio::time::timeout(PRINTER_DRAIN, printer).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            warn!(error = %e, "Printer task failed");
            None
        }
        Err(_) => {
            warn!("Output did not drain before exit");
            None
        }
    }
}

/// Refresh, apply the configured model, and load it if asked
async fn startup(conductor: &Conductor, config: &LocalChatConfig) {
    if let Err(e) = conductor.refresh().await {
        warn!(error = %e, "Initial model refresh failed");
        eprintln!("{e}");
        return;
    }
    if let Some(ref model) = config.default_model {
        if let Err(e) = conductor.select(model) {
            eprintln!("{e}");
        }
    }
    if config.auto_load {
        match conductor.models_snapshot().selected {
            Some(model) => report(conductor.load(&model)),
            None => eprintln!("No model to load"),
        }
    }
}

async fn run_command(conductor: &Conductor, command: Command) {
    match command {
        Command::Models => {
            if let Err(e) = conductor.refresh().await {
                eprintln!("{e}");
            }
            println!("{}", format_models(&conductor.models_snapshot()));
        }
        Command::Select(model) => report(conductor.select(&model)),
        Command::Load(model) => {
            let target = model.or_else(|| conductor.models_snapshot().selected);
            match target {
                Some(model) => report(conductor.load(&model)),
                None => eprintln!("No model selected"),
            }
        }
        Command::Set { key, value } => match conductor.set_config_str(&key, &value) {
            Ok(key) => eprintln!("{key} = {}", conductor.config().value(key)),
            Err(e) => eprintln!("{e}"),
        },
        Command::Config => println!("{}", format_config(&conductor.config())),
        Command::Stop => {
            if !conductor.stop() {
                eprintln!("Nothing to stop");
            }
        }
        Command::Clear => report(conductor.clear_conversation()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

fn report(result: Result<(), ConductorError>) {
    if let Err(e) = result {
        eprintln!("{e}");
    }
}

async fn print_messages(mut rx: MessageReceiver) {
    while let Some(msg) = rx.recv().await {
        if let ConductorMessage::StreamError { ref error, .. } = msg {
            debug!(error = %error, "Stream error rendered");
        }
        match render(&msg) {
            Some(Rendered::Inline(text)) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            Some(Rendered::Line(text)) => println!("{text}"),
            Some(Rendered::Status(text)) => eprintln!("{text}"),
            None => {}
        }
    }
}
