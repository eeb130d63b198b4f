//! Floating IP and VRRP reconciliation.
//!
//! Floating IPs follow their instance's primary NIC: whenever the host
//! holding it changes, the internal address is recomputed and the NAT rule
//! is re-created on the new host. VRRP role reports move the role's
//! interface and hand the backup configuration to a peer host.

use fleet_core::{
    HostId, Instance, LB_AVAILABLE, ResourceEvent, ResourceType, VrrpInstance, VrrpRole,
};
use fleet_exec::Target;
use fleet_store::{Nic, StoreTx};
use tracing::{info, warn};

use crate::config::ControlSettings;
use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};
use crate::fdb;

fn primary(nics: &[Nic]) -> Option<&Nic> {
    nics.iter().find(|n| n.interface.primary_if)
}

/// Re-home every floating IP of the instance onto its current host.
///
/// Returns the number of NAT rules dispatched.
pub async fn sync_floating_ips(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    nics: &[Nic],
) -> HandlerResult<usize> {
    let Some((primary, (address, subnet))) =
        primary(nics).and_then(|nic| Some((nic, nic.addressing()?)))
    else {
        return Ok(0);
    };
    let fips = ctx.tx.floating_ips_of_instance(instance.id).await?;
    let mut deferred = Deferred::new();
    let mut sent = 0;
    for mut fip in fips {
        let public = ctx.tx.floating_nic(fip.id).await?;
        let Some((pub_address, pub_subnet)) = public.as_ref().and_then(|nic| nic.addressing())
        else {
            warn!(fip = fip.id, "Floating IP has no public address, skipping");
            continue;
        };
        if fip.int_address != address.address {
            fip.int_address = address.address.clone();
            ctx.tx.update_floating_ip(fip.clone()).await?;
            ctx.emit(ResourceEvent::new(ResourceType::FloatingIp, fip.id, "bound"));
        }
        let command = ctx
            .script("create_floating.sh")
            .arg(fip.router_id)
            .arg(&fip.fip_address)
            .arg(&pub_subnet.gateway)
            .arg(pub_subnet.vlan)
            .arg(&address.address)
            .arg(subnet.vlan)
            .arg(fip.id)
            .arg(fip.inbound)
            .arg(fip.outbound);
        let target = Target::host(instance.hyper)?;
        if deferred.absorb(ctx.dispatch(&target, &command).await)?.is_some() {
            sent += 1;
        }
        info!(
            fip = fip.id,
            address = %pub_address.address,
            instance = instance.id,
            host = instance.hyper,
            interface = primary.interface.id,
            "Re-homed floating IP"
        );
    }
    deferred.finish(sent)
}

/// Tear down the instance's floating IP NAT rules on `host`.
pub async fn clear_floating_ips(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    primary: &Nic,
    host: HostId,
) -> HandlerResult<usize> {
    let Some(subnet) = primary.subnet.as_ref() else {
        return Ok(0);
    };
    let vlan = subnet.vlan;
    let fips = ctx.tx.floating_ips_of_instance(instance.id).await?;
    let mut deferred = Deferred::new();
    let mut sent = 0;
    for fip in fips {
        let command = ctx
            .script("clear_floating.sh")
            .arg(fip.router_id)
            .arg(&fip.fip_address)
            .arg(&fip.int_address)
            .arg(vlan)
            .arg(fip.id);
        let target = Target::host(host)?;
        if deferred.absorb(ctx.dispatch(&target, &command).await)?.is_some() {
            sent += 1;
        }
    }
    deferred.finish(sent)
}

/// Every `up` host other than `skip`, restricted to the zone when `zone_id`
/// is set, as one selectable group.
pub async fn hyper_group(
    tx: &mut dyn StoreTx,
    settings: &ControlSettings,
    zone_id: i64,
    skip: HostId,
) -> HandlerResult<Target> {
    let hosts: Vec<HostId> = tx
        .hypers()
        .await?
        .into_iter()
        .filter(|h| h.is_up() && h.hostid != skip)
        .filter(|h| zone_id <= 0 || h.zone_id == zone_id)
        .map(|h| h.hostid)
        .collect();
    if hosts.is_empty() {
        return Err(HandlerError::HostUnavailable(format!(
            "no qualified hypervisor in zone {zone_id}"
        )));
    }
    Ok(Target::select(
        format!("{}-{zone_id}", settings.zone_group_prefix),
        hosts,
    )?)
}

/// Which keepalived script family reported the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrrpFlavor {
    /// `set_vrrp_ip`: roles arrive upper-case.
    VrrpIp,
    /// `create_keepalived_conf`: roles arrive lower-case.
    KeepalivedConf,
}

impl VrrpFlavor {
    fn script(&self) -> &'static str {
        match self {
            Self::VrrpIp => "set_vrrp_ip.sh",
            Self::KeepalivedConf => "create_keepalived_conf.sh",
        }
    }

    fn backup_token(&self) -> &'static str {
        match self {
            Self::VrrpIp => "BACKUP",
            Self::KeepalivedConf => "backup",
        }
    }
}

/// A host reporting it now holds a role of a VRRP pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrrpReport {
    pub vrrp_id: i64,
    pub hyper: HostId,
    pub role: VrrpRole,
}

async fn release_load_balancers(
    ctx: &mut HandlerCtx<'_>,
    vrrp: &VrrpInstance,
) -> HandlerResult<()> {
    let released = ctx.tx.set_load_balancer_status(vrrp.id, LB_AVAILABLE).await?;
    for lb in &released {
        ctx.emit(ResourceEvent::new(
            ResourceType::LoadBalancer,
            lb.id,
            LB_AVAILABLE,
        ));
    }
    info!(vrrp = vrrp.id, count = released.len(), "Load balancers available");
    Ok(())
}

fn addressed(nic: &Nic, vrrp_id: i64, role: VrrpRole) -> HandlerResult<(&str, &str)> {
    let (address, _) = nic
        .addressing()
        .ok_or_else(|| HandlerError::not_found("vrrp address", format!("{vrrp_id}/{role}")))?;
    Ok((nic.interface.mac_addr.as_str(), address.address.as_str()))
}

/// Apply a VRRP role report.
pub async fn vrrp_role_report(
    ctx: &mut HandlerCtx<'_>,
    flavor: VrrpFlavor,
    report: VrrpReport,
) -> HandlerResult<()> {
    let VrrpReport { vrrp_id, hyper, role } = report;
    ctx.tx
        .hyper(hyper)
        .await?
        .ok_or_else(|| HandlerError::not_found("hyper", hyper))?;
    let mut vrrp = ctx
        .tx
        .vrrp_instance(vrrp_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("vrrp instance", vrrp_id))?;
    let mut nic = ctx
        .tx
        .vrrp_nic(vrrp_id, role)
        .await?
        .ok_or_else(|| HandlerError::not_found("vrrp interface", format!("{vrrp_id}/{role}")))?;

    ctx.tx.set_interface_hyper(nic.interface.id, hyper).await?;
    nic.interface.hyper = hyper;
    match role {
        VrrpRole::Master => vrrp.hyper = hyper,
        VrrpRole::Backup => vrrp.peer = hyper,
    }
    ctx.tx.update_vrrp_instance(vrrp.clone()).await?;
    info!(vrrp = vrrp_id, host = hyper, role = %role, "VRRP role moved");

    let mut deferred = Deferred::new();
    deferred.absorb(fdb::propagate(ctx, vrrp.router_id, hyper, std::slice::from_ref(&nic)).await)?;

    match role {
        VrrpRole::Master => {
            let backup = ctx
                .tx
                .vrrp_nic(vrrp_id, VrrpRole::Backup)
                .await?
                .ok_or_else(|| HandlerError::not_found("vrrp interface", format!("{vrrp_id}/backup")))?;
            let subnet = ctx
                .tx
                .subnet(vrrp.vrrp_subnet_id)
                .await?
                .ok_or_else(|| HandlerError::not_found("subnet", vrrp.vrrp_subnet_id))?;
            let (backup_mac, backup_addr) = addressed(&backup, vrrp_id, VrrpRole::Backup)?;
            let (master_mac, master_addr) = addressed(&nic, vrrp_id, VrrpRole::Master)?;
            let command = ctx
                .script(flavor.script())
                .arg(vrrp.router_id)
                .arg(vrrp.id)
                .arg(subnet.vlan)
                .arg(backup_mac)
                .arg(backup_addr)
                .arg(master_mac)
                .arg(master_addr)
                .arg(flavor.backup_token());
            let settings = ctx.settings().clone();
            match hyper_group(ctx.tx.as_mut(), &settings, vrrp.zone_id, hyper).await {
                Ok(target) => {
                    deferred.absorb(ctx.dispatch(&target, &command).await)?;
                }
                Err(HandlerError::HostUnavailable(reason)) => {
                    warn!(vrrp = vrrp_id, reason = %reason, "No peer host for the backup, releasing load balancers");
                    release_load_balancers(ctx, &vrrp).await?;
                }
                Err(e) => return Err(e),
            }
        }
        VrrpRole::Backup if flavor == VrrpFlavor::VrrpIp => {
            release_load_balancers(ctx, &vrrp).await?;
        }
        VrrpRole::Backup => {}
    }
    deferred.finish(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_exec::RecordingGateway;
    use fleet_store::{MemoryStore, StateStore, fixture};

    fn fleet() -> MemoryStore {
        fixture::fleet()
            .zone(1, "zone-a")
            .hyper_in_zone(7, "10.1.0.7", 1)
            .hyper_in_zone(9, "10.1.0.9", 1)
            .hyper_in_zone(11, "10.1.0.11", 2)
            .public_subnet(5, 100)
            .subnet(1, 5001, 3)
            .instance(42, 3, 9)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .floating_ip(1, 42, 5, "203.0.113.5/24", 300)
            .build()
    }

    #[tokio::test]
    async fn test_sync_floating_ips_rehomes() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let instance = ctx.tx.instance(42).await.unwrap().unwrap();
        let nics = ctx.tx.instance_nics(42).await.unwrap();

        let sent = sync_floating_ips(&mut ctx, &instance, &nics).await.unwrap();
        assert_eq!(sent, 1);
        let (tx, events) = ctx.into_parts();
        tx.commit().await.unwrap();
        assert_eq!(events.len(), 1);

        let dispatch = &gateway.of_script("create_floating.sh")[0];
        assert_eq!(dispatch.target, "inter=9");
        assert_eq!(
            dispatch.args(),
            vec![
                "3",
                "203.0.113.5/24",
                "172.16.5.1/24",
                "100",
                "172.16.1.10/24",
                "5001",
                "1",
                "100",
                "100"
            ]
        );
        let snap = store.snapshot().await;
        assert_eq!(snap.floating_ips[0].int_address, "172.16.1.10/24");
    }

    #[tokio::test]
    async fn test_sync_floating_ips_without_primary() {
        let store = fixture::fleet()
            .hyper(9, "10.1.0.9")
            .subnet(1, 5001, 3)
            .public_subnet(5, 100)
            .instance(42, 3, 9)
            .nic(100, 42, 1, "172.16.1.10/24", false)
            .floating_ip(1, 42, 5, "203.0.113.5/24", 300)
            .build();
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let instance = ctx.tx.instance(42).await.unwrap().unwrap();
        let nics = ctx.tx.instance_nics(42).await.unwrap();
        assert_eq!(sync_floating_ips(&mut ctx, &instance, &nics).await.unwrap(), 0);
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_clear_floating_ips_on_source() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let instance = ctx.tx.instance(42).await.unwrap().unwrap();
        let primary = ctx.tx.nic(100).await.unwrap().unwrap();
        let sent = clear_floating_ips(&mut ctx, &instance, &primary, 7).await.unwrap();
        assert_eq!(sent, 1);
        let dispatch = &gateway.dispatches()[0];
        assert_eq!(dispatch.target, "inter=7");
        assert_eq!(dispatch.script(), "clear_floating.sh");
        assert_eq!(dispatch.args()[3], "5001");
    }

    #[tokio::test]
    async fn test_hyper_group_by_zone() {
        let store = fleet();
        let settings = ControlSettings::default();
        let mut tx = store.begin().await.unwrap();
        let group = hyper_group(tx.as_mut(), &settings, 1, 7).await.unwrap();
        assert_eq!(group.to_string(), "select=group-zone-1:9");
        let any = hyper_group(tx.as_mut(), &settings, 0, 7).await.unwrap();
        assert_eq!(any.to_string(), "select=group-zone-0:9,11");
        let err = hyper_group(tx.as_mut(), &settings, 2, 11).await.unwrap_err();
        assert!(matches!(err, HandlerError::HostUnavailable(_)));
    }
}
