use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hyper::HostId;
use crate::instance::ParseStatusError;

/// Name of the phase task created when the target host has prepared.
pub const PREPARE_SOURCE_TASK: &str = "Prepare_Source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    TargetPrepared,
    SourcePrepared,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::TargetPrepared => "target_prepared",
            Self::SourcePrepared => "source_prepared",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed migrations absorb every later report.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "target_prepared" => Ok(Self::TargetPrepared),
            "source_prepared" => Ok(Self::SourcePrepared),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError {
                kind: "migration",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Cold,
    Live,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Live => "live",
        }
    }
}

/// A live or cold migration of one instance between two hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub instance_id: i64,
    #[serde(default)]
    pub force: bool,
    pub kind: MigrationKind,
    pub source_hyper: HostId,
    pub target_hyper: HostId,
    pub status: MigrationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One phase of a migration. `mission` is the owning migration id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub mission: i64,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
}

impl Task {
    /// Unsaved task row; the store assigns the id.
    pub fn new(mission: i64, name: &str, summary: &str, status: TaskStatus) -> Self {
        Self {
            id: 0,
            mission,
            name: name.to_string(),
            summary: summary.to_string(),
            status,
            message: String::new(),
        }
    }
}
