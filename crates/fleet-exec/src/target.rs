use std::collections::BTreeSet;
use std::fmt;

use fleet_core::HostId;

use crate::error::ExecError;

/// Where a command is dispatched.
///
/// Renders as the selector understood by the executor:
/// `inter=7`, `inter=`, `toall=group-fdb-7:9,11` or `select=group-zone-1:4,5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single host.
    Host(HostId),
    /// Whichever host the executor picks.
    Any,
    /// Every host of the set, in one multicast-style dispatch.
    Group {
        label: String,
        hosts: BTreeSet<HostId>,
    },
    /// One host picked by the executor from the set.
    Select {
        label: String,
        hosts: BTreeSet<HostId>,
    },
}

fn host_set(
    label: &str,
    hosts: impl IntoIterator<Item = HostId>,
) -> Result<BTreeSet<HostId>, ExecError> {
    let hosts: BTreeSet<HostId> = hosts.into_iter().collect();
    if hosts.is_empty() {
        return Err(ExecError::InvalidTarget(format!("{label}: empty host set")));
    }
    if let Some(bad) = hosts.iter().find(|h| **h < 0) {
        return Err(ExecError::InvalidTarget(format!("{label}: host {bad}")));
    }
    Ok(hosts)
}

impl Target {
    pub fn host(hostid: HostId) -> Result<Self, ExecError> {
        if hostid < 0 {
            return Err(ExecError::InvalidTarget(format!("host {hostid}")));
        }
        Ok(Self::Host(hostid))
    }

    pub fn group(
        label: impl Into<String>,
        hosts: impl IntoIterator<Item = HostId>,
    ) -> Result<Self, ExecError> {
        let label = label.into();
        let hosts = host_set(&label, hosts)?;
        Ok(Self::Group { label, hosts })
    }

    pub fn select(
        label: impl Into<String>,
        hosts: impl IntoIterator<Item = HostId>,
    ) -> Result<Self, ExecError> {
        let label = label.into();
        let hosts = host_set(&label, hosts)?;
        Ok(Self::Select { label, hosts })
    }

    /// Hosts addressed by this target.
    pub fn hosts(&self) -> Vec<HostId> {
        match self {
            Self::Host(h) => vec![*h],
            Self::Any => Vec::new(),
            Self::Group { hosts, .. } | Self::Select { hosts, .. } => {
                hosts.iter().copied().collect()
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, label: &str, hosts: &BTreeSet<HostId>) -> fmt::Result {
    write!(f, "{label}:")?;
    for (i, h) in hosts.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{h}")?;
    }
    Ok(())
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(h) => write!(f, "inter={h}"),
            Self::Any => f.write_str("inter="),
            Self::Group { label, hosts } => {
                f.write_str("toall=")?;
                write_list(f, label, hosts)
            }
            Self::Select { label, hosts } => {
                f.write_str("select=")?;
                write_list(f, label, hosts)
            }
        }
    }
}
