use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("failed to spawn executor {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("executor did not accept the command within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("executor rejected the command (exit {code}): {stderr}")]
    Rejected { code: i32, stderr: String },

    #[error("dispatch refused: {0}")]
    Refused(String),
}
