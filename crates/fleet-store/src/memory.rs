//! In-process state store.
//!
//! Each transaction works on a private copy of the committed tables taken at
//! `begin`, so transactions never wait on each other while they run. Writes
//! are tracked per row; commit publishes only the written rows and fails with
//! [`StoreError::Conflict`] when another transaction committed one of them
//! first. The shared state sits behind a plain mutex held for copies and
//! bookkeeping only, never across an await.
//!
//! `lock_free_address` is the one read that locks: the returned row stays
//! reserved for the transaction until it commits or is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_core::{
    Address, CgSnapshot, CgVolume, ConsistencyGroup, FloatingIp, HostId, Hyper, Image,
    ImageStorage, Instance, Interface, InterfaceKind, LoadBalancer, Migration, Resource,
    SecurityRule, Subnet, SubnetKind, Task, TaskStatus, Volume, VolumeBackup, VrrpInstance,
    VrrpRole, Zone,
};

use crate::error::StoreError;
use crate::snapshot::FleetSnapshot;
use crate::store::{
    Endpoint, InstanceUpdate, MigrationUpdate, Nic, Result, StateStore, StoreTx, VolumeUpdate,
};

/// Tables that transactions write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Table {
    Zone,
    Hyper,
    Resource,
    Image,
    ImageStorage,
    Instance,
    Subnet,
    Interface,
    Address,
    Volume,
    Backup,
    Migration,
    Task,
    FloatingIp,
    VrrpInstance,
    LoadBalancer,
    ConsistencyGroup,
    CgVolume,
    CgSnapshot,
}

impl Table {
    fn entity(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Hyper => "hyper",
            Self::Resource => "resource",
            Self::Image => "image",
            Self::ImageStorage => "image storage",
            Self::Instance => "instance",
            Self::Subnet => "subnet",
            Self::Interface => "interface",
            Self::Address => "address",
            Self::Volume => "volume",
            Self::Backup => "backup",
            Self::Migration => "migration",
            Self::Task => "task",
            Self::FloatingIp => "floating ip",
            Self::VrrpInstance => "vrrp instance",
            Self::LoadBalancer => "load balancer",
            Self::ConsistencyGroup => "consistency group",
            Self::CgVolume => "cg volume",
            Self::CgSnapshot => "cg snapshot",
        }
    }
}

type RowKey = (Table, i64);

/// Zone creation writes this key so that two transactions cannot both
/// create a zone of the same name.
const ZONE_NAMES: RowKey = (Table::Zone, 0);

#[derive(Debug, Clone, Default)]
struct Tables {
    zones: BTreeMap<i64, Zone>,
    hypers: BTreeMap<HostId, Hyper>,
    resources: BTreeMap<HostId, Resource>,
    images: BTreeMap<i64, Image>,
    image_storages: BTreeMap<i64, ImageStorage>,
    instances: BTreeMap<i64, Instance>,
    subnets: BTreeMap<i64, Subnet>,
    interfaces: BTreeMap<i64, Interface>,
    addresses: BTreeMap<i64, Address>,
    security_rules: BTreeMap<i64, SecurityRule>,
    volumes: BTreeMap<i64, Volume>,
    backups: BTreeMap<i64, VolumeBackup>,
    migrations: BTreeMap<i64, Migration>,
    tasks: BTreeMap<i64, Task>,
    floating_ips: BTreeMap<i64, FloatingIp>,
    vrrp_instances: BTreeMap<i64, VrrpInstance>,
    load_balancers: BTreeMap<i64, LoadBalancer>,
    consistency_groups: BTreeMap<i64, ConsistencyGroup>,
    cg_volumes: BTreeMap<i64, CgVolume>,
    cg_snapshots: BTreeMap<i64, CgSnapshot>,
}

fn index<K, T>(
    entity: &'static str,
    rows: Vec<T>,
    key: impl Fn(&T) -> K,
) -> std::result::Result<BTreeMap<K, T>, StoreError>
where
    K: Ord + Copy + Display,
{
    let mut map = BTreeMap::new();
    for row in rows {
        let k = key(&row);
        if map.insert(k, row).is_some() {
            return Err(StoreError::Duplicate {
                entity,
                id: k.to_string(),
            });
        }
    }
    Ok(map)
}

fn last_id<T>(table: &BTreeMap<i64, T>) -> i64 {
    table.keys().next_back().copied().unwrap_or(0)
}

/// Replace `key` in `to` with its row in `from`, or remove it.
macro_rules! copy_row {
    ($to:expr, $from:expr, $table:ident, $key:expr) => {
        match $from.$table.get(&$key) {
            Some(row) => {
                $to.$table.insert($key, row.clone());
            }
            None => {
                $to.$table.remove(&$key);
            }
        }
    };
}

impl Tables {
    fn from_snapshot(s: FleetSnapshot) -> std::result::Result<Self, StoreError> {
        Ok(Self {
            zones: index("zone", s.zones, |r| r.id)?,
            hypers: index("hyper", s.hypers, |r| r.hostid)?,
            resources: index("resource", s.resources, |r| r.hostid)?,
            images: index("image", s.images, |r| r.id)?,
            image_storages: index("image storage", s.image_storages, |r| r.id)?,
            instances: index("instance", s.instances, |r| r.id)?,
            subnets: index("subnet", s.subnets, |r| r.id)?,
            interfaces: index("interface", s.interfaces, |r| r.id)?,
            addresses: index("address", s.addresses, |r| r.id)?,
            security_rules: index("security rule", s.security_rules, |r| r.id)?,
            volumes: index("volume", s.volumes, |r| r.id)?,
            backups: index("backup", s.backups, |r| r.id)?,
            migrations: index("migration", s.migrations, |r| r.id)?,
            tasks: index("task", s.tasks, |r| r.id)?,
            floating_ips: index("floating ip", s.floating_ips, |r| r.id)?,
            vrrp_instances: index("vrrp instance", s.vrrp_instances, |r| r.id)?,
            load_balancers: index("load balancer", s.load_balancers, |r| r.id)?,
            consistency_groups: index("consistency group", s.consistency_groups, |r| r.id)?,
            cg_volumes: index("cg volume", s.cg_volumes, |r| r.id)?,
            cg_snapshots: index("cg snapshot", s.cg_snapshots, |r| r.id)?,
        })
    }

    fn to_snapshot(&self) -> FleetSnapshot {
        fn rows<K, T: Clone>(table: &BTreeMap<K, T>) -> Vec<T> {
            table.values().cloned().collect()
        }
        FleetSnapshot {
            zones: rows(&self.zones),
            hypers: rows(&self.hypers),
            resources: rows(&self.resources),
            images: rows(&self.images),
            instances: rows(&self.instances),
            subnets: rows(&self.subnets),
            interfaces: rows(&self.interfaces),
            addresses: rows(&self.addresses),
            security_rules: rows(&self.security_rules),
            volumes: rows(&self.volumes),
            migrations: rows(&self.migrations),
            tasks: rows(&self.tasks),
            floating_ips: rows(&self.floating_ips),
            vrrp_instances: rows(&self.vrrp_instances),
            load_balancers: rows(&self.load_balancers),
            image_storages: rows(&self.image_storages),
            backups: rows(&self.backups),
            consistency_groups: rows(&self.consistency_groups),
            cg_volumes: rows(&self.cg_volumes),
            cg_snapshots: rows(&self.cg_snapshots),
        }
    }

    fn copy_row(&mut self, from: &Tables, (table, id): RowKey) {
        match table {
            Table::Zone => copy_row!(self, from, zones, id),
            Table::Hyper | Table::Resource => {
                let Ok(hostid) = HostId::try_from(id) else {
                    return;
                };
                if table == Table::Hyper {
                    copy_row!(self, from, hypers, hostid)
                } else {
                    copy_row!(self, from, resources, hostid)
                }
            }
            Table::Image => copy_row!(self, from, images, id),
            Table::ImageStorage => copy_row!(self, from, image_storages, id),
            Table::Instance => copy_row!(self, from, instances, id),
            Table::Subnet => copy_row!(self, from, subnets, id),
            Table::Interface => copy_row!(self, from, interfaces, id),
            Table::Address => copy_row!(self, from, addresses, id),
            Table::Volume => copy_row!(self, from, volumes, id),
            Table::Backup => copy_row!(self, from, backups, id),
            Table::Migration => copy_row!(self, from, migrations, id),
            Table::Task => copy_row!(self, from, tasks, id),
            Table::FloatingIp => copy_row!(self, from, floating_ips, id),
            Table::VrrpInstance => copy_row!(self, from, vrrp_instances, id),
            Table::LoadBalancer => copy_row!(self, from, load_balancers, id),
            Table::ConsistencyGroup => copy_row!(self, from, consistency_groups, id),
            Table::CgVolume => copy_row!(self, from, cg_volumes, id),
            Table::CgSnapshot => copy_row!(self, from, cg_snapshots, id),
        }
    }

    /// Highest id in the tables whose ids the store assigns.
    fn last_id(&self, table: Table) -> i64 {
        match table {
            Table::Zone => last_id(&self.zones),
            Table::Task => last_id(&self.tasks),
            Table::ImageStorage => last_id(&self.image_storages),
            _ => 0,
        }
    }

    fn nic(&self, interface: &Interface) -> Nic {
        let address = self
            .addresses
            .values()
            .find(|a| a.interface == interface.id)
            .cloned();
        let subnet = address
            .as_ref()
            .and_then(|a| self.subnets.get(&a.subnet_id))
            .cloned();
        let second_addresses = self
            .addresses
            .values()
            .filter(|a| a.second_interface == interface.id)
            .cloned()
            .collect();
        let site_subnets: Vec<Subnet> = self
            .subnets
            .values()
            .filter(|s| s.kind == SubnetKind::Site && s.interface == interface.id)
            .cloned()
            .collect();
        let site_addresses = site_subnets
            .iter()
            .flat_map(|site| {
                self.addresses.values().filter(move |a| {
                    a.subnet_id == site.id && a.address != site.gateway && a.ip() != site.gateway
                })
            })
            .cloned()
            .collect();
        Nic {
            interface: interface.clone(),
            address,
            subnet,
            second_addresses,
            site_subnets,
            site_addresses,
        }
    }

    fn find_nic(&self, pred: impl Fn(&Interface) -> bool) -> Option<Nic> {
        self.interfaces.values().find(|i| pred(i)).map(|i| self.nic(i))
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    /// Commit number that last wrote each row.
    versions: HashMap<RowKey, u64>,
    commits: u64,
    next_tx: u64,
    /// Free addresses reserved by `lock_free_address`, by transaction.
    address_locks: HashMap<i64, u64>,
    sequences: HashMap<Table, i64>,
}

impl Shared {
    fn next_id(&mut self, table: Table) -> i64 {
        let Self {
            tables, sequences, ..
        } = self;
        let next = sequences
            .entry(table)
            .or_insert_with(|| tables.last_id(table) + 1);
        let id = *next;
        *next += 1;
        id
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`StateStore`] with snapshot isolation.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: FleetSnapshot) -> std::result::Result<Self, StoreError> {
        let shared = Shared {
            tables: Tables::from_snapshot(snapshot)?,
            ..Shared::default()
        };
        Ok(Self {
            shared: Arc::new(Mutex::new(shared)),
        })
    }

    /// Committed state.
    pub async fn snapshot(&self) -> FleetSnapshot {
        lock(&self.shared).tables.to_snapshot()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let mut shared = lock(&self.shared);
        shared.next_tx += 1;
        let tx = MemoryTx {
            shared: Arc::clone(&self.shared),
            id: shared.next_tx,
            began_at: shared.commits,
            work: shared.tables.clone(),
            written: BTreeSet::new(),
        };
        Ok(Box::new(tx))
    }
}

struct MemoryTx {
    shared: Arc<Mutex<Shared>>,
    id: u64,
    /// Commit number the working copy was taken at.
    began_at: u64,
    work: Tables,
    written: BTreeSet<RowKey>,
}

impl MemoryTx {
    fn touch(&mut self, table: Table, id: i64) {
        self.written.insert((table, id));
    }

    fn touch_host(&mut self, table: Table, hostid: HostId) {
        self.touch(table, i64::from(hostid));
    }

    fn next_id(&self, table: Table) -> i64 {
        lock(&self.shared).next_id(table)
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        let id = self.id;
        lock(&self.shared).address_locks.retain(|_, owner| *owner != id);
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn hyper(&mut self, hostid: HostId) -> Result<Option<Hyper>> {
        Ok(self.work.hypers.get(&hostid).cloned())
    }

    async fn hypers(&mut self) -> Result<Vec<Hyper>> {
        Ok(self.work.hypers.values().cloned().collect())
    }

    async fn upsert_hyper(&mut self, hyper: Hyper) -> Result<()> {
        self.touch_host(Table::Hyper, hyper.hostid);
        self.work.hypers.insert(hyper.hostid, hyper);
        Ok(())
    }

    async fn upsert_resource(&mut self, resource: Resource) -> Result<()> {
        self.touch_host(Table::Resource, resource.hostid);
        self.work.resources.insert(resource.hostid, resource);
        Ok(())
    }

    async fn zone_or_create(&mut self, name: &str) -> Result<Zone> {
        if let Some(zone) = self.work.zones.values().find(|z| z.name == name) {
            return Ok(zone.clone());
        }
        let zone = Zone {
            id: self.next_id(Table::Zone),
            name: name.to_string(),
        };
        self.written.insert(ZONE_NAMES);
        self.touch(Table::Zone, zone.id);
        self.work.zones.insert(zone.id, zone.clone());
        Ok(zone)
    }

    async fn instance(&mut self, id: i64) -> Result<Option<Instance>> {
        Ok(self.work.instances.get(&id).cloned())
    }

    async fn update_instance(&mut self, id: i64, update: InstanceUpdate) -> Result<()> {
        let instance = self
            .work
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("instance", id))?;
        if let Some(status) = update.status {
            instance.status = status;
        }
        if let Some(hyper) = update.hyper {
            instance.hyper = hyper;
        }
        if let Some(zone_id) = update.zone_id {
            instance.zone_id = zone_id;
        }
        if let Some(reason) = update.reason {
            instance.reason = reason;
        }
        self.touch(Table::Instance, id);
        Ok(())
    }

    async fn delete_instance(&mut self, id: i64) -> Result<()> {
        self.work.instances.remove(&id);
        self.touch(Table::Instance, id);
        Ok(())
    }

    async fn image(&mut self, id: i64) -> Result<Option<Image>> {
        Ok(self.work.images.get(&id).cloned())
    }

    async fn update_image(&mut self, image: Image) -> Result<()> {
        let row = self
            .work
            .images
            .get_mut(&image.id)
            .ok_or_else(|| StoreError::not_found("image", image.id))?;
        *row = image;
        let id = row.id;
        self.touch(Table::Image, id);
        Ok(())
    }

    async fn image_storage(&mut self, id: i64) -> Result<Option<ImageStorage>> {
        Ok(self.work.image_storages.get(&id).cloned())
    }

    async fn image_storages(&mut self, image_id: i64) -> Result<Vec<ImageStorage>> {
        Ok(self
            .work
            .image_storages
            .values()
            .filter(|s| s.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn save_image_storage(&mut self, mut storage: ImageStorage) -> Result<ImageStorage> {
        if storage.id == 0 {
            storage.id = self.next_id(Table::ImageStorage);
        } else if !self.work.image_storages.contains_key(&storage.id) {
            return Err(StoreError::not_found("image storage", storage.id));
        }
        self.touch(Table::ImageStorage, storage.id);
        self.work.image_storages.insert(storage.id, storage.clone());
        Ok(storage)
    }

    async fn delete_image_storage(&mut self, id: i64) -> Result<()> {
        self.work.image_storages.remove(&id);
        self.touch(Table::ImageStorage, id);
        Ok(())
    }

    async fn interface(&mut self, id: i64) -> Result<Option<Interface>> {
        Ok(self.work.interfaces.get(&id).cloned())
    }

    async fn instance_nics(&mut self, instance_id: i64) -> Result<Vec<Nic>> {
        Ok(self
            .work
            .interfaces
            .values()
            .filter(|i| i.owned_by_instance(instance_id))
            .map(|i| self.work.nic(i))
            .collect())
    }

    async fn nic(&mut self, interface_id: i64) -> Result<Option<Nic>> {
        Ok(self
            .work
            .interfaces
            .get(&interface_id)
            .map(|i| self.work.nic(i)))
    }

    async fn nic_by_mac(&mut self, instance_id: i64, mac: &str) -> Result<Option<Nic>> {
        Ok(self
            .work
            .find_nic(|i| i.owned_by_instance(instance_id) && i.mac_addr == mac))
    }

    async fn vrrp_nic(&mut self, vrrp_id: i64, role: VrrpRole) -> Result<Option<Nic>> {
        Ok(self.work.find_nic(|i| {
            i.kind == InterfaceKind::Vrrp && i.owner == vrrp_id && role.matches(&i.name)
        }))
    }

    async fn floating_nic(&mut self, floating_ip_id: i64) -> Result<Option<Nic>> {
        Ok(self
            .work
            .find_nic(|i| i.kind == InterfaceKind::Floating && i.owner == floating_ip_id))
    }

    async fn set_interface_hyper(&mut self, id: i64, hyper: HostId) -> Result<()> {
        let iface = self
            .work
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("interface", id))?;
        iface.hyper = hyper;
        self.touch(Table::Interface, id);
        Ok(())
    }

    async fn set_instance_interfaces_hyper(
        &mut self,
        instance_id: i64,
        hyper: HostId,
    ) -> Result<()> {
        let mut moved = Vec::new();
        for iface in self
            .work
            .interfaces
            .values_mut()
            .filter(|i| i.owned_by_instance(instance_id))
        {
            iface.hyper = hyper;
            moved.push(iface.id);
        }
        for id in moved {
            self.touch(Table::Interface, id);
        }
        Ok(())
    }

    async fn delete_interface(&mut self, id: i64) -> Result<()> {
        self.work.interfaces.remove(&id);
        self.touch(Table::Interface, id);
        Ok(())
    }

    async fn router_endpoints(
        &mut self,
        router_id: i64,
        exclude_hyper: HostId,
    ) -> Result<Vec<Endpoint>> {
        let by_interface: HashMap<i64, &Address> = self
            .work
            .addresses
            .values()
            .filter(|a| a.interface > 0)
            .map(|a| (a.interface, a))
            .collect();
        let mut endpoints = Vec::new();
        for iface in self.work.interfaces.values() {
            if iface.kind == InterfaceKind::Gateway || iface.hyper == exclude_hyper {
                continue;
            }
            let Some(address) = by_interface.get(&iface.id) else {
                continue;
            };
            let Some(subnet) = self.work.subnets.get(&address.subnet_id) else {
                continue;
            };
            if subnet.router_id != router_id {
                continue;
            }
            endpoints.push(Endpoint {
                interface: iface.clone(),
                address: (*address).clone(),
                subnet: subnet.clone(),
                host: self.work.hypers.get(&iface.hyper).cloned(),
            });
        }
        Ok(endpoints)
    }

    async fn subnet(&mut self, id: i64) -> Result<Option<Subnet>> {
        Ok(self.work.subnets.get(&id).cloned())
    }

    async fn addresses_of_interface(&mut self, interface_id: i64) -> Result<Vec<Address>> {
        Ok(self
            .work
            .addresses
            .values()
            .filter(|a| a.interface == interface_id || a.second_interface == interface_id)
            .cloned()
            .collect())
    }

    async fn lock_free_address(
        &mut self,
        subnet_id: i64,
        wanted: Option<&str>,
    ) -> Result<Option<Address>> {
        let subnet = self
            .work
            .subnets
            .get(&subnet_id)
            .ok_or_else(|| StoreError::not_found("subnet", subnet_id))?;
        let candidates = self
            .work
            .addresses
            .values()
            .filter(|a| a.subnet_id == subnet_id && !a.allocated)
            .filter(|a| match wanted {
                Some(w) => a.address == w || a.ip() == w,
                None => a.address != subnet.gateway && a.ip() != subnet.gateway,
            });

        let mut shared = lock(&self.shared);
        for candidate in candidates {
            let held_elsewhere = shared
                .address_locks
                .get(&candidate.id)
                .is_some_and(|owner| *owner != self.id);
            let taken = shared
                .tables
                .addresses
                .get(&candidate.id)
                .is_none_or(|committed| committed.allocated);
            if held_elsewhere || taken {
                continue;
            }
            shared.address_locks.insert(candidate.id, self.id);
            return Ok(Some(candidate.clone()));
        }
        Ok(None)
    }

    async fn update_address(&mut self, address: Address) -> Result<()> {
        let row = self
            .work
            .addresses
            .get_mut(&address.id)
            .ok_or_else(|| StoreError::not_found("address", address.id))?;
        *row = address;
        let id = row.id;
        self.touch(Table::Address, id);
        Ok(())
    }

    async fn clear_subnet_interface(&mut self, interface_id: i64) -> Result<()> {
        let mut cleared = Vec::new();
        for subnet in self
            .work
            .subnets
            .values_mut()
            .filter(|s| s.interface == interface_id)
        {
            subnet.interface = 0;
            cleared.push(subnet.id);
        }
        for id in cleared {
            self.touch(Table::Subnet, id);
        }
        Ok(())
    }

    async fn security_rules(&mut self, groups: &[i64]) -> Result<Vec<SecurityRule>> {
        Ok(self
            .work
            .security_rules
            .values()
            .filter(|r| groups.contains(&r.secgroup))
            .cloned()
            .collect())
    }

    async fn volume(&mut self, id: i64) -> Result<Option<Volume>> {
        Ok(self.work.volumes.get(&id).cloned())
    }

    async fn volumes_of_instance(&mut self, instance_id: i64) -> Result<Vec<Volume>> {
        Ok(self
            .work
            .volumes
            .values()
            .filter(|v| v.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_volume(&mut self, id: i64, update: VolumeUpdate) -> Result<()> {
        let volume = self
            .work
            .volumes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("volume", id))?;
        if let Some(status) = update.status {
            volume.status = status;
        }
        if let Some(path) = update.path {
            volume.path = path;
        }
        if let Some(target) = update.target {
            volume.target = target;
        }
        if let Some(instance_id) = update.instance_id {
            volume.instance_id = instance_id;
        }
        self.touch(Table::Volume, id);
        Ok(())
    }

    async fn backup(&mut self, id: i64) -> Result<Option<VolumeBackup>> {
        Ok(self.work.backups.get(&id).cloned())
    }

    async fn update_backup(&mut self, backup: VolumeBackup) -> Result<()> {
        let row = self
            .work
            .backups
            .get_mut(&backup.id)
            .ok_or_else(|| StoreError::not_found("backup", backup.id))?;
        *row = backup;
        let id = row.id;
        self.touch(Table::Backup, id);
        Ok(())
    }

    async fn consistency_group(&mut self, id: i64) -> Result<Option<ConsistencyGroup>> {
        Ok(self.work.consistency_groups.get(&id).cloned())
    }

    async fn update_consistency_group(&mut self, cg: ConsistencyGroup) -> Result<()> {
        let row = self
            .work
            .consistency_groups
            .get_mut(&cg.id)
            .ok_or_else(|| StoreError::not_found("consistency group", cg.id))?;
        *row = cg;
        let id = row.id;
        self.touch(Table::ConsistencyGroup, id);
        Ok(())
    }

    async fn delete_consistency_group(&mut self, id: i64) -> Result<()> {
        let members: Vec<i64> = self
            .work
            .cg_volumes
            .values()
            .filter(|m| m.cg_id == id)
            .map(|m| m.id)
            .collect();
        for member in members {
            self.work.cg_volumes.remove(&member);
            self.touch(Table::CgVolume, member);
        }
        self.work.consistency_groups.remove(&id);
        self.touch(Table::ConsistencyGroup, id);
        Ok(())
    }

    async fn cg_volumes(&mut self, cg_id: i64) -> Result<Vec<CgVolume>> {
        Ok(self
            .work
            .cg_volumes
            .values()
            .filter(|m| m.cg_id == cg_id)
            .cloned()
            .collect())
    }

    async fn cg_snapshot(&mut self, id: i64) -> Result<Option<CgSnapshot>> {
        Ok(self.work.cg_snapshots.get(&id).cloned())
    }

    async fn update_cg_snapshot(&mut self, snapshot: CgSnapshot) -> Result<()> {
        let row = self
            .work
            .cg_snapshots
            .get_mut(&snapshot.id)
            .ok_or_else(|| StoreError::not_found("cg snapshot", snapshot.id))?;
        *row = snapshot;
        let id = row.id;
        self.touch(Table::CgSnapshot, id);
        Ok(())
    }

    async fn delete_cg_snapshot(&mut self, id: i64) -> Result<()> {
        self.work.cg_snapshots.remove(&id);
        self.touch(Table::CgSnapshot, id);
        Ok(())
    }

    async fn migration(&mut self, id: i64) -> Result<Option<Migration>> {
        Ok(self.work.migrations.get(&id).cloned())
    }

    async fn latest_migration_from(
        &mut self,
        instance_id: i64,
        source_hyper: HostId,
    ) -> Result<Option<Migration>> {
        Ok(self
            .work
            .migrations
            .values()
            .rev()
            .find(|m| m.instance_id == instance_id && m.source_hyper == source_hyper)
            .cloned())
    }

    async fn update_migration(&mut self, id: i64, update: MigrationUpdate) -> Result<()> {
        let migration = self
            .work
            .migrations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("migration", id))?;
        if let Some(status) = update.status {
            migration.status = status;
        }
        if let Some(target) = update.target_hyper {
            migration.target_hyper = target;
        }
        self.touch(Table::Migration, id);
        Ok(())
    }

    async fn create_task(&mut self, mut task: Task) -> Result<Task> {
        task.id = self.next_id(Table::Task);
        self.touch(Table::Task, task.id);
        self.work.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task(&mut self, id: i64) -> Result<Option<Task>> {
        Ok(self.work.tasks.get(&id).cloned())
    }

    async fn update_task_status(&mut self, id: i64, status: TaskStatus) -> Result<()> {
        let task = self
            .work
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        task.status = status;
        self.touch(Table::Task, id);
        Ok(())
    }

    async fn tasks_of_migration(
        &mut self,
        mission: i64,
        name: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>> {
        Ok(self
            .work
            .tasks
            .values()
            .filter(|t| t.mission == mission && t.name == name && t.status == status)
            .cloned()
            .collect())
    }

    async fn floating_ips_of_instance(&mut self, instance_id: i64) -> Result<Vec<FloatingIp>> {
        Ok(self
            .work
            .floating_ips
            .values()
            .filter(|f| f.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_floating_ip(&mut self, fip: FloatingIp) -> Result<()> {
        let row = self
            .work
            .floating_ips
            .get_mut(&fip.id)
            .ok_or_else(|| StoreError::not_found("floating ip", fip.id))?;
        *row = fip;
        let id = row.id;
        self.touch(Table::FloatingIp, id);
        Ok(())
    }

    async fn vrrp_instance(&mut self, id: i64) -> Result<Option<VrrpInstance>> {
        Ok(self.work.vrrp_instances.get(&id).cloned())
    }

    async fn update_vrrp_instance(&mut self, vrrp: VrrpInstance) -> Result<()> {
        let row = self
            .work
            .vrrp_instances
            .get_mut(&vrrp.id)
            .ok_or_else(|| StoreError::not_found("vrrp instance", vrrp.id))?;
        *row = vrrp;
        let id = row.id;
        self.touch(Table::VrrpInstance, id);
        Ok(())
    }

    async fn set_load_balancer_status(
        &mut self,
        vrrp_id: i64,
        status: &str,
    ) -> Result<Vec<LoadBalancer>> {
        let mut updated = Vec::new();
        for lb in self
            .work
            .load_balancers
            .values_mut()
            .filter(|lb| lb.vrrp_instance_id == vrrp_id)
        {
            lb.status = status.to_string();
            updated.push(lb.clone());
        }
        for lb in &updated {
            self.touch(Table::LoadBalancer, lb.id);
        }
        Ok(updated)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut shared = lock(&self.shared);
        let conflict = self.written.iter().find(|key| {
            shared
                .versions
                .get(*key)
                .is_some_and(|version| *version > self.began_at)
        });
        if let Some((table, id)) = conflict {
            return Err(StoreError::Conflict {
                entity: table.entity(),
                id: id.to_string(),
            });
        }
        if self.written.is_empty() {
            return Ok(());
        }
        shared.commits += 1;
        let version = shared.commits;
        for &key in &self.written {
            shared.tables.copy_row(&self.work, key);
            shared.versions.insert(key, version);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fixture;
    use fleet_core::{AddressKind, CgStatus, InstanceStatus, StorageStatus};

    fn store() -> MemoryStore {
        fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(100, 5001, 3)
            .instance(42, 3, 7)
            .nic(1, 42, 100, "192.168.1.5/24", true)
            .free_address(100, "192.168.1.6/24")
            .build()
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        tx.update_instance(42, InstanceUpdate::status(InstanceStatus::Running))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(snap.instance(42).unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        tx.delete_instance(42).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete_interface(1).await.unwrap();
        drop(tx);

        let snap = store.snapshot().await;
        assert!(snap.instance(42).is_some());
        assert!(snap.interface(1).is_some());
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        tx.set_instance_interfaces_hyper(42, 9).await.unwrap();
        let nics = tx.instance_nics(42).await.unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].interface.hyper, 9);
        assert_eq!(nics[0].subnet.as_ref().unwrap().vlan, 5001);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = store();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .update_instance(404, InstanceUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "instance", .. }));
    }

    #[tokio::test]
    async fn test_router_endpoints_excludes_host_and_gateways() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(100, 5001, 3)
            .instance(42, 3, 7)
            .instance(43, 3, 9)
            .nic(1, 42, 100, "192.168.1.5/24", true)
            .nic(2, 43, 100, "192.168.1.6/24", true)
            .gateway_nic(3, 9, 100, "192.168.1.1/24")
            .build();
        let mut tx = store.begin().await.unwrap();

        let endpoints = tx.router_endpoints(3, 7).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].interface.id, 2);
        assert_eq!(endpoints[0].host.as_ref().unwrap().host_ip, "10.1.0.9");

        assert!(tx.router_endpoints(4, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_free_address_skips_gateway_and_allocated() {
        let store = fixture::fleet()
            .subnet(100, 5001, 3)
            .free_address(100, "172.16.100.1/24")
            .free_address(100, "172.16.100.7/24")
            .free_address(100, "172.16.100.8/24")
            .build();
        let mut tx = store.begin().await.unwrap();

        let addr = tx.lock_free_address(100, None).await.unwrap().unwrap();
        assert_eq!(addr.address, "172.16.100.7/24");

        let wanted = tx
            .lock_free_address(100, Some("172.16.100.8"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wanted.address, "172.16.100.8/24");

        tx.update_address(Address {
            allocated: true,
            interface: 5,
            kind: AddressKind::Native,
            ..wanted
        })
        .await
        .unwrap();
        assert!(
            tx.lock_free_address(100, Some("172.16.100.8/24"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(tx.lock_free_address(404, None).await.is_err());
    }

    #[tokio::test]
    async fn test_locked_address_reserved_until_drop() {
        let store = fixture::fleet()
            .subnet(100, 5001, 3)
            .free_address(100, "172.16.100.7/24")
            .free_address(100, "172.16.100.8/24")
            .build();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let a = first.lock_free_address(100, None).await.unwrap().unwrap();
        let b = second.lock_free_address(100, None).await.unwrap().unwrap();
        assert_eq!(a.address, "172.16.100.7/24");
        assert_eq!(b.address, "172.16.100.8/24");
        assert!(
            second
                .lock_free_address(100, Some("172.16.100.7"))
                .await
                .unwrap()
                .is_none()
        );

        drop(first);
        let again = second
            .lock_free_address(100, Some("172.16.100.7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, a.id);
    }

    #[tokio::test]
    async fn test_address_allocated_after_begin_is_not_handed_out() {
        let store = fixture::fleet()
            .subnet(100, 5001, 3)
            .free_address(100, "172.16.100.7/24")
            .build();
        let mut stale = store.begin().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let addr = tx.lock_free_address(100, None).await.unwrap().unwrap();
        tx.update_address(Address {
            allocated: true,
            interface: 9,
            ..addr
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert!(stale.lock_free_address(100, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_transactions_do_not_block_each_other() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .instance(42, 3, 7)
            .instance(43, 3, 7)
            .build();
        let mut first = store.begin().await.unwrap();
        first
            .update_instance(42, InstanceUpdate::status(InstanceStatus::ShutOff))
            .await
            .unwrap();

        let mut second = tokio::time::timeout(Duration::from_secs(1), store.begin())
            .await
            .expect("begin must not wait for the open transaction")
            .unwrap();
        // Uncommitted writes stay private.
        assert_eq!(
            second.instance(42).await.unwrap().unwrap().status,
            InstanceStatus::Running
        );
        second
            .update_instance(43, InstanceUpdate::status(InstanceStatus::Paused))
            .await
            .unwrap();
        second.commit().await.unwrap();
        assert_eq!(
            store.snapshot().await.instance(42).unwrap().status,
            InstanceStatus::Running
        );

        first.commit().await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.instance(42).unwrap().status, InstanceStatus::ShutOff);
        assert_eq!(snap.instance(43).unwrap().status, InstanceStatus::Paused);
    }

    #[tokio::test]
    async fn test_concurrent_write_to_same_row_conflicts() {
        let store = store();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first
            .update_instance(42, InstanceUpdate::status(InstanceStatus::ShutOff))
            .await
            .unwrap();
        second
            .update_instance(42, InstanceUpdate::status(InstanceStatus::Paused))
            .await
            .unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { entity: "instance", .. }));
        assert_eq!(
            store.snapshot().await.instance(42).unwrap().status,
            InstanceStatus::ShutOff
        );

        // Begun after the commit, so it may write the row again.
        let mut third = store.begin().await.unwrap();
        third
            .update_instance(42, InstanceUpdate::status(InstanceStatus::Running))
            .await
            .unwrap();
        third.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_zone_created_twice_conflicts() {
        let store = MemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let a = first.zone_or_create("zone-a").await.unwrap();
        let b = second.zone_or_create("zone-a").await.unwrap();
        assert_ne!(a.id, b.id);
        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::Conflict { entity: "zone", .. })
        ));
        assert_eq!(store.snapshot().await.zones, vec![a]);
    }

    #[tokio::test]
    async fn test_nic_loads_site_subnets() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .subnet(1, 5001, 0)
            .instance(42, 0, 7)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .site_subnet(30, 6030, 100)
            .free_address(30, "172.16.30.1/24")
            .free_address(30, "172.16.30.5/24")
            .free_address(30, "172.16.30.6/24")
            .site_subnet(31, 6031, 999)
            .free_address(31, "172.16.31.5/24")
            .build();
        let mut tx = store.begin().await.unwrap();
        let nic = tx.nic(100).await.unwrap().unwrap();
        assert_eq!(nic.site_subnets.len(), 1);
        assert_eq!(nic.site_subnets[0].id, 30);
        let addresses: Vec<&str> = nic.site_addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, vec!["172.16.30.5/24", "172.16.30.6/24"]);
    }

    #[tokio::test]
    async fn test_image_storage_ids_and_removal() {
        let store = fixture::fleet()
            .image(5, "creating")
            .image_storage(3, 5, "pool-a", StorageStatus::Syncing)
            .build();
        let mut tx = store.begin().await.unwrap();
        let created = tx
            .save_image_storage(ImageStorage {
                id: 0,
                image_id: 5,
                pool_id: "pool-b".to_string(),
                volume_id: "vol-9".to_string(),
                status: StorageStatus::Synced,
            })
            .await
            .unwrap();
        assert_eq!(created.id, 4);
        tx.delete_image_storage(3).await.unwrap();
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(snap.image_storages, vec![created]);
    }

    #[tokio::test]
    async fn test_delete_consistency_group_drops_memberships() {
        let store = fixture::fleet()
            .volume(1, 0, false)
            .volume(2, 0, false)
            .consistency_group(8, CgStatus::Deleting, &[1, 2])
            .consistency_group(9, CgStatus::Available, &[2])
            .build();
        let mut tx = store.begin().await.unwrap();
        tx.delete_consistency_group(8).await.unwrap();
        assert!(tx.cg_volumes(8).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let snap = store.snapshot().await;
        assert!(snap.consistency_group(8).is_none());
        assert_eq!(snap.cg_volumes.len(), 1);
        assert_eq!(snap.cg_volumes[0].cg_id, 9);
    }

    #[tokio::test]
    async fn test_create_task_assigns_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx
            .create_task(Task::new(5, "Prepare_Source", "", TaskStatus::InProgress))
            .await
            .unwrap();
        let b = tx
            .create_task(Task::new(5, "Prepare_Source", "", TaskStatus::Failed))
            .await
            .unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        let failed = tx
            .tasks_of_migration(5, "Prepare_Source", TaskStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed, vec![b]);
    }

    #[test]
    fn test_duplicate_rows_rejected() {
        let snap = FleetSnapshot {
            zones: vec![
                Zone {
                    id: 1,
                    name: "a".to_string(),
                },
                Zone {
                    id: 1,
                    name: "b".to_string(),
                },
            ],
            ..FleetSnapshot::default()
        };
        assert!(matches!(
            MemoryStore::from_snapshot(snap),
            Err(StoreError::Duplicate { entity: "zone", .. })
        ));
    }
}
