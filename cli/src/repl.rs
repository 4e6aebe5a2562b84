//! REPL input parsing
//!
//! Lines starting with `/` are commands; anything else is a prompt.

/// One line of user input
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Text to send to the model
    Prompt(String),
    /// A slash command
    Command(Command),
    /// Blank line
    Empty,
}

/// Slash commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// List models and their load status
    Models,
    /// Select a model
    Select(String),
    /// Load a model, or the selected one
    Load(Option<String>),
    /// Set a generation parameter
    Set {
        /// Parameter name
        key: String,
        /// Raw value, parsed by the core
        value: String,
    },
    /// Show generation parameters
    Config,
    /// Stop the current generation
    Stop,
    /// Clear the conversation
    Clear,
    /// Show help
    Help,
    /// Exit
    Quit,
}

/// Help text for the REPL
pub const HELP: &str = "\
Commands:
  /models              list models and their load status
  /select <id>         select a model
  /load [id]           load a model (default: the selected one)
  /set <key> <value>   set a generation parameter (e.g. /set temperature 0.9)
  /config              show generation parameters
  /stop                stop the current reply
  /clear               clear the conversation
  /help                show this help
  /quit                exit
Anything else is sent as a prompt. Ctrl-C stops a reply, or exits when idle.";

/// Parse one line of input
///
/// # Errors
///
/// Returns a message for unknown commands or missing arguments.
pub fn parse(line: &str) -> Result<Input, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Input::Prompt(line.trim_end_matches(['\r', '\n']).to_string()));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "models" | "ls" => Command::Models,
        "select" | "use" => {
            if args.is_empty() {
                return Err("usage: /select <id>".to_string());
            }
            Command::Select(args.to_string())
        }
        "load" => Command::Load((!args.is_empty()).then(|| args.to_string())),
        "set" => {
            let Some((key, value)) = args.split_once(char::is_whitespace) else {
                return Err("usage: /set <key> <value>".to_string());
            };
            Command::Set {
                key: key.to_string(),
                value: value.trim_start().to_string(),
            }
        }
        "config" => Command::Config,
        "stop" => Command::Stop,
        "clear" => Command::Clear,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command: /{other} (try /help)")),
    };
    Ok(Input::Command(command))
}
