//! Storage-side rows: pooled image copies, volume backups and consistency
//! groups.

use serde::{Deserialize, Serialize};

/// Replication state of an image copy in one storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    Syncing,
    Synced,
    Error,
    Unknown,
    NotFound,
}

impl StorageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Unknown => "unknown",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy of an image held in one storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStorage {
    pub id: i64,
    pub image_id: i64,
    pub pool_id: String,
    #[serde(default)]
    pub volume_id: String,
    #[serde(default = "default_storage_status")]
    pub status: StorageStatus,
}

fn default_storage_status() -> StorageStatus {
    StorageStatus::Syncing
}

/// Snapshot or backup of a single volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBackup {
    pub id: i64,
    pub volume_id: i64,
    #[serde(default)]
    pub name: String,
    /// `snapshot` or `backup`.
    #[serde(default)]
    pub backup_type: String,
    #[serde(default)]
    pub status: String,
    /// Same `<driver>://<location>` form as a volume path.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgStatus {
    Pending,
    Processing,
    Available,
    Error,
    Updating,
    Deleting,
}

impl CgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Available => "available",
            Self::Error => "error",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for CgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of volumes snapshotted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyGroup {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub status: CgStatus,
    /// Group id on the storage backend, set once creation succeeds.
    #[serde(default)]
    pub wds_cg_id: String,
}

/// Membership of one volume in a consistency group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgVolume {
    pub id: i64,
    pub cg_id: i64,
    pub volume_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgSnapshotStatus {
    Pending,
    Available,
    Error,
    Restoring,
    Deleting,
}

impl CgSnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Error => "error",
            Self::Restoring => "restoring",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for CgSnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of every volume in a consistency group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgSnapshot {
    pub id: i64,
    pub cg_id: i64,
    #[serde(default)]
    pub name: String,
    pub status: CgSnapshotStatus,
    /// Total size in GiB.
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub wds_snap_id: String,
    /// Running task, 0 when idle.
    #[serde(default)]
    pub task_id: i64,
}

/// Whole GiB in a byte count reported by the storage backend.
pub fn bytes_to_gib(bytes: i64) -> i64 {
    if bytes > 0 { bytes / 1024 / 1024 / 1024 } else { 0 }
}
