use std::path::Path;

use fleet_core::{
    Address, CgSnapshot, CgVolume, ConsistencyGroup, FloatingIp, Hyper, Image, ImageStorage,
    Instance, Interface, LoadBalancer, Migration, Resource, SecurityRule, Subnet, Task, Volume,
    VolumeBackup, VrrpInstance, Zone,
};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Whole-fleet state as plain JSON tables.
///
/// Used to seed a [`crate::MemoryStore`] and to dump it after a replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSnapshot {
    pub zones: Vec<Zone>,
    pub hypers: Vec<Hyper>,
    pub resources: Vec<Resource>,
    pub images: Vec<Image>,
    pub instances: Vec<Instance>,
    pub subnets: Vec<Subnet>,
    pub interfaces: Vec<Interface>,
    pub addresses: Vec<Address>,
    pub security_rules: Vec<SecurityRule>,
    pub volumes: Vec<Volume>,
    pub migrations: Vec<Migration>,
    pub tasks: Vec<Task>,
    pub floating_ips: Vec<FloatingIp>,
    pub vrrp_instances: Vec<VrrpInstance>,
    pub load_balancers: Vec<LoadBalancer>,
    pub image_storages: Vec<ImageStorage>,
    pub backups: Vec<VolumeBackup>,
    pub consistency_groups: Vec<ConsistencyGroup>,
    pub cg_volumes: Vec<CgVolume>,
    pub cg_snapshots: Vec<CgSnapshot>,
}

impl FleetSnapshot {
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn instance(&self, id: i64) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn migration(&self, id: i64) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == id)
    }

    pub fn volume(&self, id: i64) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn interface(&self, id: i64) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.id == id)
    }

    pub fn address(&self, id: i64) -> Option<&Address> {
        self.addresses.iter().find(|a| a.id == id)
    }

    pub fn image(&self, id: i64) -> Option<&Image> {
        self.images.iter().find(|i| i.id == id)
    }

    pub fn consistency_group(&self, id: i64) -> Option<&ConsistencyGroup> {
        self.consistency_groups.iter().find(|c| c.id == id)
    }

    pub fn cg_snapshot(&self, id: i64) -> Option<&CgSnapshot> {
        self.cg_snapshots.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_snapshot() {
        let snap = FleetSnapshot::parse(
            r#"{
                "hypers": [{"hostid": 7, "hostname": "hv7", "host_ip": "10.1.0.7", "status": 1}],
                "instances": [{"id": 42, "hostname": "web", "status": "pending",
                               "created_at": "2025-01-01T00:00:00Z"}]
            }"#,
        )
        .unwrap();
        assert_eq!(snap.hypers.len(), 1);
        assert!(snap.hypers[0].is_up());
        assert_eq!(snap.instance(42).unwrap().hyper, -1);
        assert!(snap.volumes.is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        let snap = FleetSnapshot {
            zones: vec![Zone {
                id: 1,
                name: "zone-a".to_string(),
            }],
            ..FleetSnapshot::default()
        };
        snap.write_to(&path).unwrap();
        assert_eq!(FleetSnapshot::from_file(&path).unwrap(), snap);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = FleetSnapshot::from_file(Path::new("/nonexistent/fleet.json")).unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }
}
