//! Agent callback lines.
//!
//! Agents report completions either as a marker line
//! `|:-COMMAND-:| launch_vm.sh '127' 'running' '3' 'sync'` or as a JSON
//! object `{"command": "launch_vm", "args": [...], "error": "..."}`.

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

pub const COMMAND_MARKER: &str = "|:-COMMAND-:|";

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("not a callback line: {0}")]
    NotACallback(String),

    #[error("callback line has no command")]
    MissingCommand,

    #[error("invalid JSON callback: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid callback pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// A parsed callback, ready for [`Dispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub command: String,
    /// Positional arguments; `args[0]` is the command name.
    pub args: Vec<String>,
    /// Failure reported by the agent itself.
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonCallback {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct LineParser {
    marker: Regex,
    token: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self, IngressError> {
        Ok(Self {
            marker: Regex::new(&format!(r"^\s*{}\s*(.*)$", regex::escape(COMMAND_MARKER)))?,
            token: Regex::new(r"'([^']*)'|(\S+)")?,
        })
    }

    pub fn parse(&self, line: &str) -> Result<Callback, IngressError> {
        let line = line.trim();
        if line.starts_with('{') {
            return self.parse_json(line);
        }
        let rest = self
            .marker
            .captures(line)
            .and_then(|c| c.get(1))
            .ok_or_else(|| not_a_callback(line))?
            .as_str();

        let mut tokens = self.token.captures_iter(rest).filter_map(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .map(|m| m.as_str().to_string())
        });
        let script = tokens.next().ok_or(IngressError::MissingCommand)?;
        let command = command_name(&script);
        if command.is_empty() {
            return Err(IngressError::MissingCommand);
        }

        let mut args = vec![command.clone()];
        args.extend(tokens);
        Ok(Callback {
            command,
            args,
            error: None,
        })
    }

    fn parse_json(&self, line: &str) -> Result<Callback, IngressError> {
        let raw: JsonCallback = serde_json::from_str(line)?;
        let command = command_name(&raw.command);
        if command.is_empty() {
            return Err(IngressError::MissingCommand);
        }
        let mut args = raw.args;
        if args.first().map(|a| command_name(a)) != Some(command.clone()) {
            args.insert(0, command.clone());
        }
        Ok(Callback {
            command,
            args,
            error: raw.error.filter(|e| !e.is_empty()),
        })
    }
}

fn not_a_callback(line: &str) -> IngressError {
    IngressError::NotACallback(line.chars().take(80).collect())
}

/// `/opt/scripts/launch_vm.sh` -> `launch_vm`.
fn command_name(script: &str) -> String {
    let base = script.rsplit('/').next().unwrap_or(script);
    base.strip_suffix(".sh").unwrap_or(base).to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Feed every callback of a log through the dispatcher, in order.
///
/// Blank lines and `#` comments are ignored. Lines that do not parse and
/// unknown commands count as skipped.
pub async fn replay(dispatcher: &Dispatcher, parser: &LineParser, content: &str) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let callback = match parser.parse(line) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping line");
                summary.skipped += 1;
                continue;
            }
        };
        if dispatcher.registry().lookup(&callback.command).is_none() {
            debug!(line = number + 1, command = %callback.command, "Unknown command");
            summary.skipped += 1;
            continue;
        }
        match dispatcher
            .dispatch(&callback.command, &callback.args, callback.error.as_deref())
            .await
        {
            Ok(_) => summary.applied += 1,
            Err(_) => summary.failed += 1,
        }
    }
    info!(
        applied = summary.applied,
        failed = summary.failed,
        skipped = summary.skipped,
        "Replay finished"
    );
    summary
}
