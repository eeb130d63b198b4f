// fleet-core: Pure types, lifecycle rules, wire payloads
// No internal fleet dependencies; everything else builds on this crate.

pub mod event;
pub mod hyper;
pub mod instance;
pub mod migration;
pub mod network;
pub mod payload;
pub mod storage;
pub mod time;
pub mod volume;

pub use event::{ResourceEvent, ResourceType};
pub use hyper::{HYPER_UP, HostId, Hyper, NO_HOST, Resource, Zone};
pub use instance::{Image, Instance, InstanceStatus, ParseStatusError, TransitionError};
pub use migration::{Migration, MigrationKind, MigrationStatus, Task, TaskStatus};
pub use network::{
    Address, AddressKind, FloatingIp, Interface, InterfaceKind, LB_AVAILABLE, LoadBalancer,
    SecurityRule, Subnet, SubnetKind, VrrpInstance, VrrpRole,
};
pub use payload::{FdbRule, NO_GATEWAY, SecurityData, VlanInfo, VolumeInfo};
pub use storage::{
    CgSnapshot, CgSnapshotStatus, CgStatus, CgVolume, ConsistencyGroup, ImageStorage, StorageStatus,
    VolumeBackup, bytes_to_gib,
};
pub use volume::{Volume, VolumeStatus};
