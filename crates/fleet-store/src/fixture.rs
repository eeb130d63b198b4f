//! Fleet fixtures for tests.
//!
//! Builds a [`FleetSnapshot`] row by row with realistic defaults, so tests
//! only spell out the ids and topology they care about.

use fleet_core::{
    Address, AddressKind, CgSnapshot, CgSnapshotStatus, CgStatus, CgVolume, ConsistencyGroup,
    FloatingIp, HostId, Hyper, Image, ImageStorage, Instance, InstanceStatus, Interface,
    InterfaceKind, LoadBalancer, Migration, MigrationKind, MigrationStatus, NO_HOST, SecurityRule,
    StorageStatus, Subnet, SubnetKind, Task, Volume, VolumeBackup, VolumeStatus, VrrpInstance,
    Zone,
};
use fleet_core::time::utc_now;

use crate::memory::MemoryStore;
use crate::snapshot::FleetSnapshot;

/// Start an empty fleet.
pub fn fleet() -> FleetBuilder {
    FleetBuilder {
        snapshot: FleetSnapshot::default(),
    }
}

pub struct FleetBuilder {
    snapshot: FleetSnapshot,
}

fn mac_for(interface_id: i64) -> String {
    format!(
        "52:54:00:00:{:02x}:{:02x}",
        (interface_id >> 8) & 0xff,
        interface_id & 0xff
    )
}

impl FleetBuilder {
    fn next_address_id(&self) -> i64 {
        self.snapshot.addresses.iter().map(|a| a.id).max().unwrap_or(0) + 1
    }

    fn push_address(&mut self, subnet_id: i64, address: &str, interface: i64, second: i64) {
        let id = self.next_address_id();
        self.snapshot.addresses.push(Address {
            id,
            subnet_id,
            address: address.to_string(),
            allocated: interface > 0 || second > 0,
            interface,
            second_interface: second,
            kind: if second > 0 && interface == 0 {
                AddressKind::Second
            } else {
                AddressKind::Native
            },
        });
    }

    pub fn zone(mut self, id: i64, name: &str) -> Self {
        self.snapshot.zones.push(Zone {
            id,
            name: name.to_string(),
        });
        self
    }

    /// An `up` host named `hv<id>`.
    pub fn hyper(mut self, hostid: HostId, host_ip: &str) -> Self {
        self.snapshot
            .hypers
            .push(Hyper::new(hostid, &format!("hv{hostid}"), host_ip));
        self
    }

    pub fn hyper_in_zone(mut self, hostid: HostId, host_ip: &str, zone_id: i64) -> Self {
        let mut hyper = Hyper::new(hostid, &format!("hv{hostid}"), host_ip);
        hyper.zone_id = zone_id;
        self.snapshot.hypers.push(hyper);
        self
    }

    /// A host that reports itself down.
    pub fn down_hyper(mut self, hostid: HostId, host_ip: &str) -> Self {
        let mut hyper = Hyper::new(hostid, &format!("hv{hostid}"), host_ip);
        hyper.status = 0;
        self.snapshot.hypers.push(hyper);
        self
    }

    fn push_subnet(self, id: i64, vlan: i64, router_id: i64, kind: SubnetKind) -> Self {
        self.push_subnet_on(id, vlan, router_id, kind, 0)
    }

    fn push_subnet_on(
        mut self,
        id: i64,
        vlan: i64,
        router_id: i64,
        kind: SubnetKind,
        interface: i64,
    ) -> Self {
        self.snapshot.subnets.push(Subnet {
            id,
            name: format!("subnet-{id}"),
            vlan,
            gateway: format!("172.16.{}.1/24", id % 256),
            netmask: "255.255.255.0".to_string(),
            kind,
            router_id,
            interface,
        });
        self
    }

    /// Internal subnet; the gateway is `172.16.<id>.1/24`.
    pub fn subnet(self, id: i64, vlan: i64, router_id: i64) -> Self {
        self.push_subnet(id, vlan, router_id, SubnetKind::Internal)
    }

    pub fn public_subnet(self, id: i64, vlan: i64) -> Self {
        self.push_subnet(id, vlan, 0, SubnetKind::Public)
    }

    pub fn vrrp_subnet(self, id: i64, vlan: i64, router_id: i64) -> Self {
        self.push_subnet(id, vlan, router_id, SubnetKind::Vrrp)
    }

    /// Classic site subnet routed through an instance interface. Its
    /// addresses are added with [`Self::free_address`].
    pub fn site_subnet(self, id: i64, vlan: i64, interface_id: i64) -> Self {
        self.push_subnet_on(id, vlan, 0, SubnetKind::Site, interface_id)
    }

    /// Instance on `router_id` placed on `hyper`; `running` when placed,
    /// `pending` otherwise.
    pub fn instance(mut self, id: i64, router_id: i64, hyper: HostId) -> Self {
        self.snapshot.instances.push(Instance {
            id,
            hostname: format!("vm-{id}"),
            status: if hyper == NO_HOST {
                InstanceStatus::Pending
            } else {
                InstanceStatus::Running
            },
            reason: String::new(),
            hyper,
            zone_id: 0,
            router_id,
            image_id: 0,
            created_at: utc_now(),
        });
        self
    }

    pub fn instance_status(mut self, id: i64, status: InstanceStatus) -> Self {
        if let Some(instance) = self.snapshot.instances.iter_mut().find(|i| i.id == id) {
            instance.status = status;
        }
        self
    }

    pub fn instance_image(mut self, id: i64, image_id: i64, os_code: &str) -> Self {
        if let Some(instance) = self.snapshot.instances.iter_mut().find(|i| i.id == id) {
            instance.image_id = image_id;
        }
        self.snapshot.images.push(Image {
            id: image_id,
            uuid: format!("img{image_id:05}-0000-4000-8000"),
            name: format!("image-{image_id}"),
            os_code: os_code.to_string(),
            status: "available".to_string(),
            format: "qcow2".to_string(),
            size: 0,
        });
        self
    }

    /// Linux image in `status`, uuid `img<id:05>-0000-4000-8000`.
    pub fn image(mut self, id: i64, status: &str) -> Self {
        self.snapshot.images.push(Image {
            id,
            uuid: format!("img{id:05}-0000-4000-8000"),
            name: format!("image-{id}"),
            os_code: "linux".to_string(),
            status: status.to_string(),
            format: String::new(),
            size: 0,
        });
        self
    }

    pub fn image_storage(
        mut self,
        id: i64,
        image_id: i64,
        pool_id: &str,
        status: StorageStatus,
    ) -> Self {
        self.snapshot.image_storages.push(ImageStorage {
            id,
            image_id,
            pool_id: pool_id.to_string(),
            volume_id: String::new(),
            status,
        });
        self
    }

    /// Instance NIC with its main address. Placed on the instance's host.
    pub fn nic(
        mut self,
        interface_id: i64,
        instance_id: i64,
        subnet_id: i64,
        address: &str,
        primary: bool,
    ) -> Self {
        let hyper = self
            .snapshot
            .instance(instance_id)
            .map_or(NO_HOST, |i| i.hyper);
        let index = self
            .snapshot
            .interfaces
            .iter()
            .filter(|i| i.owned_by_instance(instance_id))
            .count();
        self.snapshot.interfaces.push(Interface {
            id: interface_id,
            name: format!("eth{index}"),
            mac_addr: mac_for(interface_id),
            kind: InterfaceKind::Instance,
            owner: instance_id,
            hyper,
            primary_if: primary,
            inbound: 1000,
            outbound: 1000,
            allow_spoofing: false,
            security_groups: Vec::new(),
        });
        self.push_address(subnet_id, address, interface_id, 0);
        self
    }

    pub fn nic_security_group(mut self, interface_id: i64, group: i64) -> Self {
        if let Some(iface) = self
            .snapshot
            .interfaces
            .iter_mut()
            .find(|i| i.id == interface_id)
        {
            iface.security_groups.push(group);
        }
        self
    }

    pub fn security_rule(mut self, rule: SecurityRule) -> Self {
        self.snapshot.security_rules.push(rule);
        self
    }

    /// Extra address carried by an interface beside its main one.
    pub fn second_address(mut self, interface_id: i64, subnet_id: i64, address: &str) -> Self {
        self.push_address(subnet_id, address, 0, interface_id);
        self
    }

    pub fn free_address(mut self, subnet_id: i64, address: &str) -> Self {
        self.push_address(subnet_id, address, 0, 0);
        self
    }

    /// Router gateway device; never part of FDB rule sets.
    pub fn gateway_nic(
        mut self,
        interface_id: i64,
        hyper: HostId,
        subnet_id: i64,
        address: &str,
    ) -> Self {
        self.snapshot.interfaces.push(Interface {
            id: interface_id,
            name: "gateway".to_string(),
            mac_addr: mac_for(interface_id),
            kind: InterfaceKind::Gateway,
            owner: subnet_id,
            hyper,
            primary_if: false,
            inbound: 0,
            outbound: 0,
            allow_spoofing: true,
            security_groups: Vec::new(),
        });
        self.push_address(subnet_id, address, interface_id, 0);
        self
    }

    pub fn vrrp(mut self, id: i64, router_id: i64, zone_id: i64, subnet_id: i64) -> Self {
        self.snapshot.vrrp_instances.push(VrrpInstance {
            id,
            router_id,
            zone_id,
            vrrp_subnet_id: subnet_id,
            hyper: NO_HOST,
            peer: NO_HOST,
        });
        self
    }

    /// VRRP interface named after its role (`MASTER` / `BACKUP`).
    pub fn vrrp_nic(
        mut self,
        interface_id: i64,
        vrrp_id: i64,
        role_name: &str,
        subnet_id: i64,
        address: &str,
    ) -> Self {
        self.snapshot.interfaces.push(Interface {
            id: interface_id,
            name: role_name.to_string(),
            mac_addr: mac_for(interface_id),
            kind: InterfaceKind::Vrrp,
            owner: vrrp_id,
            hyper: NO_HOST,
            primary_if: false,
            inbound: 0,
            outbound: 0,
            allow_spoofing: true,
            security_groups: Vec::new(),
        });
        self.push_address(subnet_id, address, interface_id, 0);
        self
    }

    pub fn load_balancer(mut self, id: i64, vrrp_id: i64, status: &str) -> Self {
        let router_id = self
            .snapshot
            .vrrp_instances
            .iter()
            .find(|v| v.id == vrrp_id)
            .map_or(0, |v| v.router_id);
        self.snapshot.load_balancers.push(LoadBalancer {
            id,
            name: format!("lb-{id}"),
            status: status.to_string(),
            vrrp_instance_id: vrrp_id,
            router_id,
        });
        self
    }

    /// Floating IP mapped to an instance, with its public-side interface.
    pub fn floating_ip(
        mut self,
        id: i64,
        instance_id: i64,
        public_subnet_id: i64,
        fip_address: &str,
        interface_id: i64,
    ) -> Self {
        let router_id = self
            .snapshot
            .instance(instance_id)
            .map_or(0, |i| i.router_id);
        self.snapshot.floating_ips.push(FloatingIp {
            id,
            name: format!("fip-{id}"),
            fip_address: fip_address.to_string(),
            int_address: String::new(),
            instance_id,
            router_id,
            inbound: 100,
            outbound: 100,
        });
        self.snapshot.interfaces.push(Interface {
            id: interface_id,
            name: "fip".to_string(),
            mac_addr: mac_for(interface_id),
            kind: InterfaceKind::Floating,
            owner: id,
            hyper: NO_HOST,
            primary_if: false,
            inbound: 0,
            outbound: 0,
            allow_spoofing: false,
            security_groups: Vec::new(),
        });
        self.push_address(public_subnet_id, fip_address, interface_id, 0);
        self
    }

    /// Volume at `local:///var/lib/volumes/volume-<id>.qcow2`, bound to the
    /// instance when `instance_id > 0`.
    pub fn volume(mut self, id: i64, instance_id: i64, booting: bool) -> Self {
        let attached = instance_id > 0;
        self.snapshot.volumes.push(Volume {
            id,
            uuid: format!("vol-uuid-{id}"),
            name: format!("volume-{id}"),
            path: format!("local:///var/lib/volumes/volume-{id}.qcow2"),
            size: 10,
            booting,
            status: if attached {
                VolumeStatus::Attached
            } else {
                VolumeStatus::Available
            },
            target: if attached {
                if booting { "vda" } else { "vdb" }.to_string()
            } else {
                String::new()
            },
            instance_id,
        });
        self
    }

    pub fn backup(mut self, id: i64, volume_id: i64, status: &str) -> Self {
        self.snapshot.backups.push(VolumeBackup {
            id,
            volume_id,
            name: format!("backup-{id}"),
            backup_type: "snapshot".to_string(),
            status: status.to_string(),
            path: String::new(),
        });
        self
    }

    /// Consistency group over `volumes`.
    pub fn consistency_group(mut self, id: i64, status: CgStatus, volumes: &[i64]) -> Self {
        self.snapshot.consistency_groups.push(ConsistencyGroup {
            id,
            name: format!("cg-{id}"),
            status,
            wds_cg_id: String::new(),
        });
        for &volume_id in volumes {
            let row = self.snapshot.cg_volumes.iter().map(|v| v.id).max().unwrap_or(0) + 1;
            self.snapshot.cg_volumes.push(CgVolume {
                id: row,
                cg_id: id,
                volume_id,
            });
        }
        self
    }

    /// Snapshot of a consistency group with a running task.
    pub fn cg_snapshot(mut self, id: i64, cg_id: i64, status: CgSnapshotStatus) -> Self {
        self.snapshot.cg_snapshots.push(CgSnapshot {
            id,
            cg_id,
            name: format!("cg-snap-{id}"),
            status,
            size: 0,
            wds_snap_id: String::new(),
            task_id: 900 + id,
        });
        self
    }

    /// Volume in an explicit status, keeping its binding.
    pub fn volume_status(mut self, id: i64, status: VolumeStatus) -> Self {
        if let Some(v) = self.snapshot.volumes.iter_mut().find(|v| v.id == id) {
            v.status = status;
        }
        self
    }

    /// Pending cold migration of an instance away from `source_hyper`.
    pub fn migration(mut self, id: i64, instance_id: i64, source_hyper: HostId) -> Self {
        self.snapshot.migrations.push(Migration {
            id,
            name: format!("migration-{id}"),
            instance_id,
            force: false,
            kind: MigrationKind::Cold,
            source_hyper,
            target_hyper: NO_HOST,
            status: MigrationStatus::Pending,
        });
        self
    }

    pub fn migration_status(mut self, id: i64, status: MigrationStatus) -> Self {
        if let Some(m) = self.snapshot.migrations.iter_mut().find(|m| m.id == id) {
            m.status = status;
        }
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.snapshot.tasks.push(task);
        self
    }

    pub fn snapshot(self) -> FleetSnapshot {
        self.snapshot
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore::from_snapshot(self.snapshot).expect("fixture ids must be unique")
    }
}
