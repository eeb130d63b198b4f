use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hyper::{HostId, NO_HOST};

/// Instance lifecycle status as stored and as reported by hypervisor agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    ShutOff,
    Paused,
    Migrating,
    Reinstalling,
    Resizing,
    Deleting,
    Deleted,
    Error,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShutOff => "shut_off",
            Self::Paused => "paused",
            Self::Migrating => "migrating",
            Self::Reinstalling => "reinstalling",
            Self::Resizing => "resizing",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// `error` and `unknown` are only left by removal or an authoritative sync.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, Self::Error | Self::Unknown)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised status string in a callback or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for InstanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shut_off" => Self::ShutOff,
            "paused" => Self::Paused,
            "migrating" => Self::Migrating,
            "reinstalling" => Self::Reinstalling,
            "resizing" => Self::Resizing,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "error" => Self::Error,
            "unknown" => Self::Unknown,
            other => {
                return Err(ParseStatusError {
                    kind: "instance",
                    value: other.to_string(),
                });
            }
        };
        Ok(status)
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// Validate that a reported status may replace the stored one.
///
/// Refused: anything leaving `deleted`, anything but `deleted` once deletion
/// started, returning to `pending` after placement, and leaving `error` or
/// `unknown` for anything but removal. The last two only yield to an
/// authoritative report, see [`validate_report`].
pub fn validate_transition(from: InstanceStatus, to: InstanceStatus) -> Result<(), TransitionError> {
    use InstanceStatus::*;

    if from == to {
        return Ok(());
    }

    let valid = match (from, to) {
        (Deleted, _) => false,
        (Deleting, Deleted | Error) => true,
        (Deleting, _) => false,
        (_, Pending) => false,
        (_, Error | Unknown) => true,
        (Error | Unknown, Deleting | Deleted) => true,
        (Error | Unknown, _) => false,
        (
            Pending,
            Running | ShutOff | Paused | Deleting | Deleted,
        ) => true,
        (
            Running,
            ShutOff | Paused | Migrating | Reinstalling | Resizing | Deleting | Deleted,
        ) => true,
        (
            ShutOff | Paused | Migrating | Reinstalling | Resizing,
            Running | ShutOff | Paused | Migrating | Reinstalling | Resizing | Deleting | Deleted,
        ) => true,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Like [`validate_transition`], but an authoritative report (a host syncing
/// an instance it is running) may also bring it back from `error` or
/// `unknown`.
pub fn validate_report(
    from: InstanceStatus,
    to: InstanceStatus,
    authoritative: bool,
) -> Result<(), TransitionError> {
    if authoritative && to == InstanceStatus::Running && from.is_absorbing() {
        return Ok(());
    }
    validate_transition(from, to)
}

/// A virtual machine row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub hostname: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub reason: String,
    /// Host id, or `NO_HOST` before placement.
    #[serde(default = "default_hyper")]
    pub hyper: HostId,
    #[serde(default)]
    pub zone_id: i64,
    /// Owning router (VPC); 0 for classic networking.
    #[serde(default)]
    pub router_id: i64,
    #[serde(default)]
    pub image_id: i64,
    pub created_at: DateTime<Utc>,
}

fn default_hyper() -> HostId {
    NO_HOST
}

impl Instance {
    /// Instances on a router take part in overlay FDB propagation.
    pub fn is_vpc(&self) -> bool {
        self.router_id > 0
    }
}

/// Boot image. Storage agents report its status, format and size once it has
/// been captured or imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    #[serde(default)]
    pub uuid: String,
    pub name: String,
    #[serde(default = "default_os_code")]
    pub os_code: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub format: String,
    /// Bytes.
    #[serde(default)]
    pub size: i64,
}

impl Image {
    /// Name prefix of the image's pooled copies: the first uuid segment.
    pub fn volume_prefix(&self) -> &str {
        self.uuid.split('-').next().unwrap_or("")
    }
}

/// OS family assumed when an instance's image cannot be resolved.
pub fn default_os_code() -> String {
    "linux".to_string()
}
