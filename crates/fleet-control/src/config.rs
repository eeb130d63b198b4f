use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level control plane configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub ingress: IngressSettings,
}

/// Settings shared by every handler.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSettings {
    /// Directory of the backend scripts on every hypervisor.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    /// Label prefix of FDB group dispatches (`<prefix>-<host>`).
    #[serde(default = "default_fdb_group_prefix")]
    pub fdb_group_prefix: String,
    /// Label prefix of zone peer groups (`<prefix>-<zone>`).
    #[serde(default = "default_zone_group_prefix")]
    pub zone_group_prefix: String,
    /// Capacity of the resource-change event queue.
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    /// Volume driver of the fleet, `local` or `wds_vhost`. Image captures
    /// on `local` report the image format and size themselves.
    #[serde(default = "default_volume_driver")]
    pub volume_driver: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Executor handed `<target> <command>` for every dispatch.
    #[serde(default = "default_gateway_program")]
    pub program: PathBuf,
    /// Arguments placed before the target.
    #[serde(default)]
    pub args: Vec<String>,
    /// Hand-off timeout (seconds). Not the remote runtime.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressSettings {
    /// Address `fleetctl serve` accepts callback lines on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_scripts_dir() -> String {
    "/opt/cloudland/scripts/backend".to_string()
}
fn default_fdb_group_prefix() -> String {
    "group-fdb".to_string()
}
fn default_zone_group_prefix() -> String {
    "group-zone".to_string()
}
fn default_event_queue_size() -> usize {
    1024
}
fn default_volume_driver() -> String {
    "local".to_string()
}
fn default_gateway_program() -> PathBuf {
    PathBuf::from("/usr/local/bin/fleet-exec")
}
fn default_gateway_timeout() -> u64 {
    10
}
fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7461))
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            fdb_group_prefix: default_fdb_group_prefix(),
            zone_group_prefix: default_zone_group_prefix(),
            event_queue_size: default_event_queue_size(),
            volume_driver: default_volume_driver(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            program: default_gateway_program(),
            args: Vec::new(),
            timeout_secs: default_gateway_timeout(),
        }
    }
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl FleetConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse fleet config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let control = &self.control;
        if control.scripts_dir.trim().is_empty() {
            anyhow::bail!("[control] scripts_dir must not be empty");
        }
        if control.fdb_group_prefix.trim().is_empty() || control.zone_group_prefix.trim().is_empty()
        {
            anyhow::bail!("[control] group prefixes must not be empty");
        }
        if control.event_queue_size == 0 {
            anyhow::bail!("[control] event_queue_size must be greater than 0");
        }
        if !matches!(control.volume_driver.as_str(), "local" | "wds_vhost") {
            anyhow::bail!(
                "[control] unknown volume_driver '{}'",
                control.volume_driver
            );
        }
        if self.gateway.timeout_secs == 0 {
            anyhow::bail!("[gateway] timeout_secs must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FleetConfig::parse("").unwrap();
        assert_eq!(config.control.scripts_dir, "/opt/cloudland/scripts/backend");
        assert_eq!(config.control.fdb_group_prefix, "group-fdb");
        assert_eq!(config.control.zone_group_prefix, "group-zone");
        assert_eq!(config.control.event_queue_size, 1024);
        assert_eq!(config.control.volume_driver, "local");
        assert_eq!(config.gateway.timeout_secs, 10);
        assert_eq!(config.ingress.listen.port(), 7461);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[control]
scripts_dir = "/srv/backend"
fdb_group_prefix = "fdb"
zone_group_prefix = "zone"
event_queue_size = 16
volume_driver = "wds_vhost"

[gateway]
program = "/usr/bin/ssh"
args = ["ctl-01", "fleet-exec"]
timeout_secs = 3

[ingress]
listen = "0.0.0.0:9000"
"#;
        let config = FleetConfig::parse(toml).unwrap();
        assert_eq!(config.control.scripts_dir, "/srv/backend");
        assert_eq!(config.control.event_queue_size, 16);
        assert_eq!(config.control.volume_driver, "wds_vhost");
        assert_eq!(config.gateway.program, PathBuf::from("/usr/bin/ssh"));
        assert_eq!(config.gateway.args, vec!["ctl-01", "fleet-exec"]);
        assert_eq!(config.ingress.listen.port(), 9000);
    }

    #[test]
    fn test_reject_empty_scripts_dir() {
        let err = FleetConfig::parse("[control]\nscripts_dir = \"\"\n").unwrap_err();
        assert!(format!("{err}").contains("scripts_dir"));
    }

    #[test]
    fn test_reject_zero_values() {
        assert!(FleetConfig::parse("[control]\nevent_queue_size = 0\n").is_err());
        let err = FleetConfig::parse("[gateway]\ntimeout_secs = 0\n").unwrap_err();
        assert!(format!("{err}").contains("timeout_secs"));
    }

    #[test]
    fn test_reject_empty_group_prefix() {
        let err = FleetConfig::parse("[control]\nfdb_group_prefix = \" \"\n").unwrap_err();
        assert!(format!("{err}").contains("group prefixes"));
    }

    #[test]
    fn test_reject_unknown_volume_driver() {
        let err = FleetConfig::parse("[control]\nvolume_driver = \"nfs\"\n").unwrap_err();
        assert!(format!("{err}").contains("volume_driver"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(format!("{err}").contains("Failed to read fleet config"));
    }
}
