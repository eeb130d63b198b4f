use std::collections::HashMap;

/// Callback commands understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    LaunchVm,
    ActionVm,
    ClearVm,
    MigrateVm,
    AttachVmNic,
    DetachVmNic,
    AttachVolume,
    CreateVolume,
    ResizeVolume,
    HyperStatus,
    SetVrrpIp,
    CreateKeepalivedConf,
    ClearSecondIps,
    CaptureImage,
    CreateImage,
    SyncImageInfo,
    VolumeSnapshot,
    CreateCg,
    DeleteCg,
    AddVolumesToCg,
    RemoveVolumesFromCg,
    CreateCgSnapshot,
    DeleteCgSnapshot,
    RestoreCgSnapshot,
}

/// Wire names, in registration order. Agents use the storage-driver
/// specific names for volume attachment.
pub const COMMANDS: &[(&str, Command)] = &[
    ("launch_vm", Command::LaunchVm),
    ("action_vm", Command::ActionVm),
    ("clear_vm", Command::ClearVm),
    ("migrate_vm", Command::MigrateVm),
    ("attach_vm_nic", Command::AttachVmNic),
    ("detach_vm_nic", Command::DetachVmNic),
    ("attach_volume", Command::AttachVolume),
    ("attach_volume_local", Command::AttachVolume),
    ("attach_volume_wds_vhost", Command::AttachVolume),
    ("create_volume", Command::CreateVolume),
    ("resize_volume", Command::ResizeVolume),
    ("hyper_status", Command::HyperStatus),
    ("set_vrrp_ip", Command::SetVrrpIp),
    ("create_keepalived_conf", Command::CreateKeepalivedConf),
    ("clear_second_ips", Command::ClearSecondIps),
    ("capture_image", Command::CaptureImage),
    ("create_image", Command::CreateImage),
    ("sync_image_info", Command::SyncImageInfo),
    ("vol_snapshot_wds_vhost", Command::VolumeSnapshot),
    ("create_cg_wds", Command::CreateCg),
    ("delete_cg_wds", Command::DeleteCg),
    ("add_volumes_to_cg_wds", Command::AddVolumesToCg),
    ("remove_volumes_from_cg_wds", Command::RemoveVolumesFromCg),
    ("create_cg_snapshot_wds", Command::CreateCgSnapshot),
    ("delete_cg_snapshot_wds", Command::DeleteCgSnapshot),
    ("restore_cg_snapshot_wds", Command::RestoreCgSnapshot),
];

impl Command {
    /// Canonical wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LaunchVm => "launch_vm",
            Self::ActionVm => "action_vm",
            Self::ClearVm => "clear_vm",
            Self::MigrateVm => "migrate_vm",
            Self::AttachVmNic => "attach_vm_nic",
            Self::DetachVmNic => "detach_vm_nic",
            Self::AttachVolume => "attach_volume",
            Self::CreateVolume => "create_volume",
            Self::ResizeVolume => "resize_volume",
            Self::HyperStatus => "hyper_status",
            Self::SetVrrpIp => "set_vrrp_ip",
            Self::CreateKeepalivedConf => "create_keepalived_conf",
            Self::ClearSecondIps => "clear_second_ips",
            Self::CaptureImage => "capture_image",
            Self::CreateImage => "create_image",
            Self::SyncImageInfo => "sync_image_info",
            Self::VolumeSnapshot => "vol_snapshot_wds_vhost",
            Self::CreateCg => "create_cg_wds",
            Self::DeleteCg => "delete_cg_wds",
            Self::AddVolumesToCg => "add_volumes_to_cg_wds",
            Self::RemoveVolumesFromCg => "remove_volumes_from_cg_wds",
            Self::CreateCgSnapshot => "create_cg_snapshot_wds",
            Self::DeleteCgSnapshot => "delete_cg_snapshot_wds",
            Self::RestoreCgSnapshot => "restore_cg_snapshot_wds",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lookup table from wire name to command. Built once, read-only after.
#[derive(Debug, Clone)]
pub struct Registry {
    by_name: HashMap<&'static str, Command>,
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            by_name: COMMANDS.iter().copied().collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Command> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered wire names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        COMMANDS.iter().map(|(name, _)| *name)
    }
}
