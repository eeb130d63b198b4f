use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::ExecError;
use crate::gateway::RemoteExec;
use crate::target::Target;

/// One captured dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub target: String,
    pub command: String,
    /// False when the dispatch was refused by failure injection.
    pub delivered: bool,
}

impl Dispatch {
    /// Script file name of the command, e.g. `add_fwrule.sh`.
    pub fn script(&self) -> &str {
        let first = self.command.split_whitespace().next().unwrap_or("");
        first.rsplit('/').next().unwrap_or(first)
    }

    /// The quoted positional arguments, unquoted.
    pub fn args(&self) -> Vec<String> {
        let line = self.command.lines().next().unwrap_or("");
        let mut args = Vec::new();
        let mut rest = line;
        while let Some(start) = rest.find('\'') {
            let after = &rest[start + 1..];
            let Some(end) = after.find('\'') else {
                break;
            };
            args.push(after[..end].to_string());
            rest = &after[end + 1..];
        }
        args
    }

    /// The heredoc JSON payload, if any.
    pub fn payload(&self) -> Option<serde_json::Value> {
        let (_, body) = self.command.split_once("<<EOF\n")?;
        let body = body.strip_suffix("\nEOF")?;
        serde_json::from_str(body).ok()
    }
}

/// Captures dispatches instead of sending them, used by `fleetctl replay`
/// and tests. Scripts can be made to fail to exercise dispatch errors.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    dispatches: Mutex<Vec<Dispatch>>,
    failing: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every later dispatch of this script (`"*"` for all scripts).
    pub fn fail_script(&self, script: &str) {
        lock(&self.failing).push(script.to_string());
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        lock(&self.dispatches).clone()
    }

    /// Dispatches of one script.
    pub fn of_script(&self, script: &str) -> Vec<Dispatch> {
        lock(&self.dispatches)
            .iter()
            .filter(|d| d.script() == script)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.dispatches).clear();
    }
}

#[async_trait]
impl RemoteExec for RecordingGateway {
    async fn execute(&self, target: &Target, command: &str) -> Result<(), ExecError> {
        let mut dispatch = Dispatch {
            target: target.to_string(),
            command: command.to_string(),
            delivered: true,
        };
        let script = dispatch.script().to_string();
        let refused = lock(&self.failing)
            .iter()
            .any(|s| s == "*" || *s == script);
        dispatch.delivered = !refused;
        lock(&self.dispatches).push(dispatch);
        if refused {
            return Err(ExecError::Refused(script));
        }
        Ok(())
    }
}
