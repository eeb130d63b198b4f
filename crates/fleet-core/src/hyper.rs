use serde::{Deserialize, Serialize};

/// Externally assigned hypervisor id. Negative values mean "no host".
pub type HostId = i32;

/// Host id carried by instances and interfaces that are not placed yet.
pub const NO_HOST: HostId = -1;

/// `Hyper::status` value of a host that is up.
pub const HYPER_UP: i32 = 1;

/// Availability zone, created on first report by a hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: i64,
    pub name: String,
}

/// A hypervisor host in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyper {
    pub hostid: HostId,
    pub hostname: String,
    /// Outer (VTEP) address other hosts tunnel overlay traffic to.
    pub host_ip: String,
    #[serde(default)]
    pub zone_id: i64,
    pub status: i32,
    #[serde(default)]
    pub virt_type: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default = "default_over_rate")]
    pub cpu_over_rate: f32,
    #[serde(default = "default_over_rate")]
    pub mem_over_rate: f32,
    #[serde(default = "default_over_rate")]
    pub disk_over_rate: f32,
}

fn default_over_rate() -> f32 {
    1.0
}

impl Hyper {
    /// Minimal row for a freshly reported host.
    pub fn new(hostid: HostId, hostname: &str, host_ip: &str) -> Self {
        Self {
            hostid,
            hostname: hostname.to_string(),
            host_ip: host_ip.to_string(),
            zone_id: 0,
            status: HYPER_UP,
            virt_type: String::new(),
            cpu_model: String::new(),
            cpu_over_rate: default_over_rate(),
            mem_over_rate: default_over_rate(),
            disk_over_rate: default_over_rate(),
        }
    }

    /// A host can source or receive traffic and migrations only when it has a
    /// valid id and reports itself up.
    pub fn is_up(&self) -> bool {
        self.hostid >= 0 && self.status == HYPER_UP
    }
}

/// Capacity counters reported by `hyper_status`. Overwritten on every report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub hostid: HostId,
    pub cpu: i64,
    pub cpu_total: i64,
    pub memory: i64,
    pub memory_total: i64,
    pub disk: i64,
    pub disk_total: i64,
}
