//! JSON payloads carried in the heredoc block of remote script invocations.

use serde::{Deserialize, Serialize};

/// Gateway value for VRRP subnets, whose addresses are not default-routable.
pub const NO_GATEWAY: &str = "nogateway";

/// One VXLAN forwarding entry: inner (guest) address and MAC mapped to the
/// outer (host) IP that terminates the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbRule {
    /// Interface name on the owning guest.
    pub instance: String,
    pub vni: i64,
    pub inner_ip: String,
    pub inner_mac: String,
    pub outer_ip: String,
    pub gateway: String,
    pub router: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityData {
    pub secgroup: i64,
    pub remote_ip: String,
    pub remote_group: i64,
    pub direction: String,
    pub ip_version: String,
    pub protocol: String,
    pub port_min: i32,
    pub port_max: i32,
}

/// Network description of one guest NIC, pushed by `sync_nic_info.sh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanInfo {
    pub device: String,
    pub vlan: i64,
    pub gateway: String,
    pub router: i64,
    #[serde(default)]
    pub public_link: i64,
    pub inbound: i32,
    pub outbound: i32,
    pub allow_spoofing: bool,
    #[serde(rename = "ip_address")]
    pub ip_addr: String,
    #[serde(rename = "mac_address")]
    pub mac_addr: String,
    #[serde(rename = "security")]
    pub sec_rules: Vec<SecurityData>,
    pub more_addresses: Vec<String>,
}

/// Volume manifest entry handed to the source host of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: i64,
    /// Volume id inside the origin storage pool.
    pub uuid: String,
    pub device: String,
    pub booting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fdb_rule_wire_names() {
        let rule = FdbRule {
            instance: "eth0".to_string(),
            vni: 5001,
            inner_ip: "192.168.1.5/24".to_string(),
            inner_mac: "52:54:00:00:00:01".to_string(),
            outer_ip: "10.1.0.7".to_string(),
            gateway: NO_GATEWAY.to_string(),
            router: 3,
        };
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["inner_mac"], "52:54:00:00:00:01");
        assert_eq!(value["gateway"], "nogateway");
        assert_eq!(value["vni"], 5001);
    }

    #[test]
    fn test_vlan_info_renamed_fields() {
        let info = VlanInfo {
            device: "eth0".to_string(),
            vlan: 5001,
            gateway: "192.168.1.1/24".to_string(),
            router: 3,
            public_link: 0,
            inbound: 100,
            outbound: 100,
            allow_spoofing: false,
            ip_addr: "192.168.1.5/24".to_string(),
            mac_addr: "52:54:00:00:00:01".to_string(),
            sec_rules: Vec::new(),
            more_addresses: vec!["192.168.1.9/24".to_string()],
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["ip_address"], "192.168.1.5/24");
        assert_eq!(value["mac_address"], "52:54:00:00:00:01");
        assert!(value["security"].as_array().unwrap().is_empty());
    }
}
