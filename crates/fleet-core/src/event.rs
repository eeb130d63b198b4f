use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::utc_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Instance,
    Volume,
    Interface,
    FloatingIp,
    Migration,
    LoadBalancer,
    Hyper,
    Image,
    Backup,
    ConsistencyGroup,
    CgSnapshot,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::Interface => "interface",
            Self::FloatingIp => "floating_ip",
            Self::Migration => "migration",
            Self::LoadBalancer => "load_balancer",
            Self::Hyper => "hyper",
            Self::Image => "image",
            Self::Backup => "backup",
            Self::ConsistencyGroup => "consistency_group",
            Self::CgSnapshot => "cg_snapshot",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed state change, published for downstream notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub resource_type: ResourceType,
    pub resource_id: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceEvent {
    pub fn new(resource_type: ResourceType, resource_id: i64, status: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id,
            status: status.into(),
            previous_status: None,
            timestamp: utc_now(),
        }
    }

    pub fn with_previous(mut self, previous: impl Into<String>) -> Self {
        self.previous_status = Some(previous.into());
        self
    }
}
