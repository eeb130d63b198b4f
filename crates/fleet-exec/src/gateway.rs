use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::target::Target;

/// Hands commands to hypervisor agents.
///
/// `execute` returns once the command has been handed off; it never waits
/// for, or reports, the remote result.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn execute(&self, target: &Target, command: &str) -> Result<(), ExecError>;
}

/// Dispatches through an external executor program, invoked as
/// `<program> [args...] <target> <command>`. A zero exit means the executor
/// accepted the command.
#[derive(Debug, Clone)]
pub struct ProcessGateway {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessGateway {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Leading arguments passed before the target.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl RemoteExec for ProcessGateway {
    async fn execute(&self, target: &Target, command: &str) -> Result<(), ExecError> {
        let target = target.to_string();
        tracing::debug!(program = %self.program.display(), %target, "dispatching command");

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                timeout: self.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecError::Rejected {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
