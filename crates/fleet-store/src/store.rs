use async_trait::async_trait;
use fleet_core::{
    Address, CgSnapshot, CgVolume, ConsistencyGroup, FloatingIp, HostId, Hyper, Image,
    ImageStorage, Instance, InstanceStatus, Interface, LoadBalancer, Migration, MigrationStatus,
    Resource, SecurityRule, Subnet, Task, TaskStatus, Volume, VolumeBackup, VolumeStatus,
    VrrpInstance, VrrpRole, Zone,
};

use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Partial update of an instance row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub hyper: Option<HostId>,
    pub zone_id: Option<i64>,
    pub reason: Option<String>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeUpdate {
    pub status: Option<VolumeStatus>,
    pub path: Option<String>,
    pub target: Option<String>,
    pub instance_id: Option<i64>,
}

impl VolumeUpdate {
    pub fn status(status: VolumeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Back to `available`, unbound from any instance.
    pub fn detached() -> Self {
        Self {
            status: Some(VolumeStatus::Available),
            path: None,
            target: Some(String::new()),
            instance_id: Some(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationUpdate {
    pub status: Option<MigrationStatus>,
    pub target_hyper: Option<HostId>,
}

/// An interface together with its eagerly loaded addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct Nic {
    pub interface: Interface,
    pub address: Option<Address>,
    pub subnet: Option<Subnet>,
    /// Second addresses bound to this interface, oldest first.
    pub second_addresses: Vec<Address>,
    /// Site subnets routed through this interface.
    pub site_subnets: Vec<Subnet>,
    /// Every address of the site subnets except their gateways.
    pub site_addresses: Vec<Address>,
}

impl Nic {
    /// Address and subnet, when the interface is fully addressed.
    pub fn addressing(&self) -> Option<(&Address, &Subnet)> {
        Some((self.address.as_ref()?, self.subnet.as_ref()?))
    }
}

/// One row of the router endpoint join: a peer interface on a router with
/// its address, subnet and (if it exists) the host it runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub interface: Interface,
    pub address: Address,
    pub subnet: Subnet,
    pub host: Option<Hyper>,
}

/// A transactional unit of work.
///
/// Reads see the transaction's own writes. Nothing is visible to other
/// transactions until [`StoreTx::commit`]; dropping the transaction without
/// committing discards every write. A commit whose rows were changed by a
/// concurrent commit fails with [`StoreError::Conflict`].
#[async_trait]
pub trait StoreTx: Send {
    // Hypervisors and zones
    async fn hyper(&mut self, hostid: HostId) -> Result<Option<Hyper>>;
    async fn hypers(&mut self) -> Result<Vec<Hyper>>;
    async fn upsert_hyper(&mut self, hyper: Hyper) -> Result<()>;
    async fn upsert_resource(&mut self, resource: Resource) -> Result<()>;
    /// Zone with this name, created if missing.
    async fn zone_or_create(&mut self, name: &str) -> Result<Zone>;

    // Instances
    async fn instance(&mut self, id: i64) -> Result<Option<Instance>>;
    async fn update_instance(&mut self, id: i64, update: InstanceUpdate) -> Result<()>;
    async fn delete_instance(&mut self, id: i64) -> Result<()>;

    // Images
    async fn image(&mut self, id: i64) -> Result<Option<Image>>;
    async fn update_image(&mut self, image: Image) -> Result<()>;
    async fn image_storage(&mut self, id: i64) -> Result<Option<ImageStorage>>;
    /// Copies of the image, ordered by id.
    async fn image_storages(&mut self, image_id: i64) -> Result<Vec<ImageStorage>>;
    /// Insert (`id == 0`) or replace a pool copy; returns the stored row.
    async fn save_image_storage(&mut self, storage: ImageStorage) -> Result<ImageStorage>;
    async fn delete_image_storage(&mut self, id: i64) -> Result<()>;

    // Interfaces
    async fn interface(&mut self, id: i64) -> Result<Option<Interface>>;
    /// Interfaces owned by an instance, with addressing, ordered by id.
    async fn instance_nics(&mut self, instance_id: i64) -> Result<Vec<Nic>>;
    async fn nic(&mut self, interface_id: i64) -> Result<Option<Nic>>;
    async fn nic_by_mac(&mut self, instance_id: i64, mac: &str) -> Result<Option<Nic>>;
    async fn vrrp_nic(&mut self, vrrp_id: i64, role: VrrpRole) -> Result<Option<Nic>>;
    /// Public-side interface of a floating IP.
    async fn floating_nic(&mut self, floating_ip_id: i64) -> Result<Option<Nic>>;
    async fn set_interface_hyper(&mut self, id: i64, hyper: HostId) -> Result<()>;
    async fn set_instance_interfaces_hyper(&mut self, instance_id: i64, hyper: HostId)
    -> Result<()>;
    async fn delete_interface(&mut self, id: i64) -> Result<()>;
    /// Every non-gateway interface whose subnet belongs to `router_id` and
    /// whose host is not `exclude_hyper`, joined to address, subnet and host
    /// in a single pass.
    async fn router_endpoints(
        &mut self,
        router_id: i64,
        exclude_hyper: HostId,
    ) -> Result<Vec<Endpoint>>;

    // Addresses and subnets
    async fn subnet(&mut self, id: i64) -> Result<Option<Subnet>>;
    /// Every address referencing the interface as main or second owner.
    async fn addresses_of_interface(&mut self, interface_id: i64) -> Result<Vec<Address>>;
    /// Lock and return a free address of the subnet: `wanted` when given,
    /// otherwise the first free one that is not the subnet gateway.
    async fn lock_free_address(
        &mut self,
        subnet_id: i64,
        wanted: Option<&str>,
    ) -> Result<Option<Address>>;
    async fn update_address(&mut self, address: Address) -> Result<()>;
    /// Unbind the interface from any subnet it serves.
    async fn clear_subnet_interface(&mut self, interface_id: i64) -> Result<()>;
    async fn security_rules(&mut self, groups: &[i64]) -> Result<Vec<SecurityRule>>;

    // Volumes
    async fn volume(&mut self, id: i64) -> Result<Option<Volume>>;
    async fn volumes_of_instance(&mut self, instance_id: i64) -> Result<Vec<Volume>>;
    async fn update_volume(&mut self, id: i64, update: VolumeUpdate) -> Result<()>;
    async fn backup(&mut self, id: i64) -> Result<Option<VolumeBackup>>;
    async fn update_backup(&mut self, backup: VolumeBackup) -> Result<()>;

    // Consistency groups
    async fn consistency_group(&mut self, id: i64) -> Result<Option<ConsistencyGroup>>;
    async fn update_consistency_group(&mut self, cg: ConsistencyGroup) -> Result<()>;
    /// Remove the group together with its volume memberships.
    async fn delete_consistency_group(&mut self, id: i64) -> Result<()>;
    async fn cg_volumes(&mut self, cg_id: i64) -> Result<Vec<CgVolume>>;
    async fn cg_snapshot(&mut self, id: i64) -> Result<Option<CgSnapshot>>;
    async fn update_cg_snapshot(&mut self, snapshot: CgSnapshot) -> Result<()>;
    async fn delete_cg_snapshot(&mut self, id: i64) -> Result<()>;

    // Migrations and tasks
    async fn migration(&mut self, id: i64) -> Result<Option<Migration>>;
    /// Most recent migration of the instance away from `source_hyper`.
    async fn latest_migration_from(
        &mut self,
        instance_id: i64,
        source_hyper: HostId,
    ) -> Result<Option<Migration>>;
    async fn update_migration(&mut self, id: i64, update: MigrationUpdate) -> Result<()>;
    /// Insert a task and return it with its assigned id.
    async fn create_task(&mut self, task: Task) -> Result<Task>;
    async fn task(&mut self, id: i64) -> Result<Option<Task>>;
    async fn update_task_status(&mut self, id: i64, status: TaskStatus) -> Result<()>;
    async fn tasks_of_migration(
        &mut self,
        mission: i64,
        name: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>>;

    // Floating IPs, VRRP and load balancers
    async fn floating_ips_of_instance(&mut self, instance_id: i64) -> Result<Vec<FloatingIp>>;
    async fn update_floating_ip(&mut self, fip: FloatingIp) -> Result<()>;
    async fn vrrp_instance(&mut self, id: i64) -> Result<Option<VrrpInstance>>;
    async fn update_vrrp_instance(&mut self, vrrp: VrrpInstance) -> Result<()>;
    /// Set the status of every load balancer backed by the VRRP instance.
    async fn set_load_balancer_status(
        &mut self,
        vrrp_id: i64,
        status: &str,
    ) -> Result<Vec<LoadBalancer>>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Source of transactions.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}
