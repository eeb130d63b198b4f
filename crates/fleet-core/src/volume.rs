use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::instance::ParseStatusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Available,
    Attaching,
    Attached,
    Detaching,
    Resizing,
    Restoring,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Resizing => "resizing",
            Self::Restoring => "restoring",
            Self::Error => "error",
        }
    }

    /// Statuses in which the volume is bound to an instance.
    pub fn is_attach_class(&self) -> bool {
        matches!(self, Self::Attaching | Self::Attached | Self::Detaching)
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "attaching" => Ok(Self::Attaching),
            "attached" => Ok(Self::Attached),
            "detaching" => Ok(Self::Detaching),
            "resizing" => Ok(Self::Resizing),
            "restoring" => Ok(Self::Restoring),
            "error" => Ok(Self::Error),
            other => Err(ParseStatusError {
                kind: "volume",
                value: other.to_string(),
            }),
        }
    }
}

/// A block device.
///
/// `path` encodes the driver and location as `<driver>://<location>`:
/// `local:///var/lib/volumes/volume-1.qcow2` or `wds_vhost://<pool>/<volume>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i32,
    #[serde(default)]
    pub booting: bool,
    pub status: VolumeStatus,
    /// Guest device name, e.g. `vdb`.
    #[serde(default)]
    pub target: String,
    /// Owning instance; 0 when detached.
    #[serde(default)]
    pub instance_id: i64,
}

impl Volume {
    fn path_parts(&self) -> Option<Vec<&str>> {
        let (driver, rest) = self.path.split_once("://")?;
        if driver == "local" {
            Some(vec![driver, rest])
        } else {
            let mut parts = vec![driver];
            parts.extend(rest.split('/'));
            Some(parts)
        }
    }

    /// Storage driver, e.g. `local` or `wds_vhost`; empty when unset.
    pub fn driver(&self) -> &str {
        self.path_parts()
            .and_then(|p| p.first().copied())
            .unwrap_or("")
    }

    /// Storage pool of a pooled volume.
    pub fn pool_id(&self) -> Option<&str> {
        match self.path_parts() {
            Some(parts) if parts.len() == 3 => Some(parts[1]),
            _ => None,
        }
    }

    /// Volume id inside the origin pool, falling back to the uuid.
    pub fn origin_volume_id(&self) -> &str {
        match self.path_parts() {
            Some(parts) if parts.len() == 3 => parts[2],
            _ => &self.uuid,
        }
    }

    /// `instance_id > 0` exactly when the status is attach-class.
    pub fn is_consistent(&self) -> bool {
        (self.instance_id > 0) == self.status.is_attach_class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(path: &str) -> Volume {
        Volume {
            id: 1,
            uuid: "9b1e7c2a".to_string(),
            name: "data".to_string(),
            path: path.to_string(),
            size: 10,
            booting: false,
            status: VolumeStatus::Available,
            target: String::new(),
            instance_id: 0,
        }
    }

    #[test]
    fn test_local_path() {
        let v = volume("local:///var/lib/volumes/volume-1.qcow2");
        assert_eq!(v.driver(), "local");
        assert_eq!(v.pool_id(), None);
        assert_eq!(v.origin_volume_id(), "9b1e7c2a");
    }

    #[test]
    fn test_pooled_path() {
        let v = volume("wds_vhost://pool-a/vol-77");
        assert_eq!(v.driver(), "wds_vhost");
        assert_eq!(v.pool_id(), Some("pool-a"));
        assert_eq!(v.origin_volume_id(), "vol-77");
    }

    #[test]
    fn test_empty_path() {
        let v = volume("");
        assert_eq!(v.driver(), "");
        assert_eq!(v.origin_volume_id(), "9b1e7c2a");
    }

    #[test]
    fn test_consistency() {
        let mut v = volume("");
        assert!(v.is_consistent());
        v.status = VolumeStatus::Attached;
        assert!(!v.is_consistent());
        v.instance_id = 42;
        assert!(v.is_consistent());
    }
}
