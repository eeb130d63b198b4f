use std::fmt;

use serde::Serialize;

use crate::error::ExecError;

/// A remote script invocation: `<dir>/<script> 'arg' ... [<<EOF ... EOF]`.
///
/// Positional arguments are single-quoted; an optional JSON payload follows
/// as a heredoc block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    path: String,
    args: Vec<String>,
    payload: Option<String>,
}

fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

impl ScriptCommand {
    pub fn new(scripts_dir: &str, script: &str) -> Self {
        Self {
            path: format!("{}/{}", scripts_dir.trim_end_matches('/'), script),
            args: Vec::new(),
            payload: None,
        }
    }

    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Attach a JSON payload as a heredoc block.
    pub fn payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self, ExecError> {
        self.payload = Some(serde_json::to_string(payload)?);
        Ok(self)
    }

    /// Script file name without its directory.
    pub fn script(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " <<EOF\n{payload}\nEOF")?;
        }
        Ok(())
    }
}
