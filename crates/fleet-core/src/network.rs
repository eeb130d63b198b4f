//! Overlay network rows: interfaces, addresses, subnets, floating IPs and
//! VRRP pairs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hyper::{HostId, NO_HOST};

/// What kind of object owns an interface. An interface has exactly one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Instance,
    Floating,
    Dhcp,
    Gateway,
    Vrrp,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Floating => "floating",
            Self::Dhcp => "dhcp",
            Self::Gateway => "gateway",
            Self::Vrrp => "vrrp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub id: i64,
    /// Device name (`eth0`), or the VRRP role for `vrrp` interfaces.
    pub name: String,
    pub mac_addr: String,
    pub kind: InterfaceKind,
    /// Id of the owning instance, floating IP, DHCP subnet or VRRP instance.
    pub owner: i64,
    #[serde(default = "default_hyper")]
    pub hyper: HostId,
    #[serde(default)]
    pub primary_if: bool,
    #[serde(default)]
    pub inbound: i32,
    #[serde(default)]
    pub outbound: i32,
    #[serde(default)]
    pub allow_spoofing: bool,
    #[serde(default)]
    pub security_groups: Vec<i64>,
}

fn default_hyper() -> HostId {
    NO_HOST
}

impl Interface {
    pub fn owned_by_instance(&self, instance_id: i64) -> bool {
        self.kind == InterfaceKind::Instance && self.owner == instance_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Native,
    Second,
}

/// One IP of a subnet's pool, in CIDR form (`10.0.0.5/24`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub subnet_id: i64,
    pub address: String,
    #[serde(default)]
    pub allocated: bool,
    /// Interface holding this as its main address; 0 when none.
    #[serde(default)]
    pub interface: i64,
    /// Interface holding this as a second address; 0 when none.
    #[serde(default)]
    pub second_interface: i64,
    #[serde(default = "default_address_kind")]
    pub kind: AddressKind,
}

fn default_address_kind() -> AddressKind {
    AddressKind::Native
}

impl Address {
    /// `allocated` must agree with the two owner references.
    pub fn is_consistent(&self) -> bool {
        self.allocated == (self.interface > 0 || self.second_interface > 0)
    }

    /// The address without its prefix length.
    pub fn ip(&self) -> &str {
        self.address
            .split_once('/')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    Public,
    Internal,
    Site,
    Vrrp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// VXLAN network identifier.
    pub vlan: i64,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub netmask: String,
    pub kind: SubnetKind,
    #[serde(default)]
    pub router_id: i64,
    /// Device interface serving this subnet (DHCP or gateway), or for a
    /// site subnet the instance interface it is routed through; 0 when none.
    #[serde(default)]
    pub interface: i64,
}

impl Subnet {
    pub fn is_public(&self) -> bool {
        self.kind == SubnetKind::Public
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: i64,
    pub secgroup: i64,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default)]
    pub remote_group: i64,
    pub direction: String,
    #[serde(default = "default_ip_version")]
    pub ip_version: String,
    pub protocol: String,
    #[serde(default)]
    pub port_min: i32,
    #[serde(default)]
    pub port_max: i32,
}

fn default_ip_version() -> String {
    "ipv4".to_string()
}

/// A public address NATed to an instance's primary address.
///
/// The public side is an interface of kind `floating` owned by this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub fip_address: String,
    /// Mirrors the bound instance's primary address; empty when unmapped.
    #[serde(default)]
    pub int_address: String,
    #[serde(default)]
    pub instance_id: i64,
    #[serde(default)]
    pub router_id: i64,
    #[serde(default)]
    pub inbound: i32,
    #[serde(default)]
    pub outbound: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VrrpRole {
    Master,
    Backup,
}

impl VrrpRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Backup => "backup",
        }
    }

    pub fn peer(&self) -> Self {
        match self {
            Self::Master => Self::Backup,
            Self::Backup => Self::Master,
        }
    }

    /// VRRP interfaces are named after their role, in either case.
    pub fn matches(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(self.as_str())
    }
}

impl std::fmt::Display for VrrpRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown vrrp role '{0}'")]
pub struct ParseRoleError(pub String);

impl FromStr for VrrpRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("master") {
            Ok(Self::Master)
        } else if s.eq_ignore_ascii_case("backup") {
            Ok(Self::Backup)
        } else {
            Err(ParseRoleError(s.to_string()))
        }
    }
}

/// A VRRP failover pair backing a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrrpInstance {
    pub id: i64,
    pub router_id: i64,
    #[serde(default)]
    pub zone_id: i64,
    pub vrrp_subnet_id: i64,
    /// Host of the master side.
    #[serde(default = "default_hyper")]
    pub hyper: HostId,
    /// Host of the backup side.
    #[serde(default = "default_hyper")]
    pub peer: HostId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub status: String,
    pub vrrp_instance_id: i64,
    #[serde(default)]
    pub router_id: i64,
}

pub const LB_AVAILABLE: &str = "available";
