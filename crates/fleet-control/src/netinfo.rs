//! Guest network descriptions pushed to hypervisors.

use fleet_core::instance::default_os_code;
use fleet_core::{HostId, Instance, SecurityData, VlanInfo};
use fleet_exec::Target;
use fleet_store::{Nic, StoreTx};
use tracing::{debug, warn};

use crate::context::HandlerCtx;
use crate::error::{HandlerError, HandlerResult};

/// Guest OS family of the instance's image, `linux` when unknown.
pub async fn os_code(tx: &mut dyn StoreTx, instance: &Instance) -> HandlerResult<String> {
    match tx.image(instance.image_id).await? {
        Some(image) => Ok(image.os_code),
        None => {
            debug!(instance = instance.id, image = instance.image_id, "Image not found, assuming linux");
            Ok(default_os_code())
        }
    }
}

/// Addresses the guest carries beside the NIC's main one: its second
/// addresses, then for classic instances every site subnet address.
pub fn more_addresses(instance: &Instance, nic: &Nic) -> Vec<String> {
    let site = if instance.is_vpc() {
        &[]
    } else {
        nic.site_addresses.as_slice()
    };
    nic.second_addresses
        .iter()
        .chain(site)
        .map(|a| a.address.clone())
        .collect()
}

/// Full description of one NIC, or `None` when it has no address yet.
pub async fn vlan_info(
    tx: &mut dyn StoreTx,
    instance: &Instance,
    nic: &Nic,
) -> HandlerResult<Option<VlanInfo>> {
    let Some((address, subnet)) = nic.addressing() else {
        return Ok(None);
    };
    let iface = &nic.interface;
    let sec_rules = tx
        .security_rules(&iface.security_groups)
        .await?
        .into_iter()
        .map(|rule| SecurityData {
            secgroup: rule.secgroup,
            remote_ip: rule.remote_ip,
            remote_group: rule.remote_group,
            direction: rule.direction,
            ip_version: rule.ip_version,
            protocol: rule.protocol,
            port_min: rule.port_min,
            port_max: rule.port_max,
        })
        .collect();
    Ok(Some(VlanInfo {
        device: iface.name.clone(),
        vlan: subnet.vlan,
        gateway: subnet.gateway.clone(),
        router: subnet.router_id,
        public_link: 0,
        inbound: iface.inbound,
        outbound: iface.outbound,
        allow_spoofing: iface.allow_spoofing,
        ip_addr: address.address.clone(),
        mac_addr: iface.mac_addr.clone(),
        sec_rules,
        more_addresses: more_addresses(instance, nic),
    }))
}

/// Push every NIC of the instance to its current host (`sync_nic_info.sh`).
pub async fn sync_nic_info(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    nics: &[Nic],
) -> HandlerResult<usize> {
    let mut vlans = Vec::with_capacity(nics.len());
    for nic in nics {
        match vlan_info(ctx.tx.as_mut(), instance, nic).await? {
            Some(info) => vlans.push(info),
            None => warn!(
                instance = instance.id,
                interface = nic.interface.id,
                "Interface has no address, left out of nic sync"
            ),
        }
    }
    let os = os_code(ctx.tx.as_mut(), instance).await?;
    let command = ctx
        .script("sync_nic_info.sh")
        .arg(instance.id)
        .arg(&instance.hostname)
        .arg(&os)
        .payload(&vlans)?;
    let target = Target::host(instance.hyper)?;
    ctx.dispatch(&target, &command).await?;
    Ok(vlans.len())
}

/// Drop the NIC's extra addresses from `host` (`clear_second_ips.sh`).
pub async fn clear_second_ips(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    nic: &Nic,
    host: HostId,
) -> HandlerResult<()> {
    let os = os_code(ctx.tx.as_mut(), instance).await?;
    let command = ctx
        .script("clear_second_ips.sh")
        .arg(instance.id)
        .arg(&nic.interface.mac_addr)
        .arg(&os)
        .payload(&more_addresses(instance, nic))?;
    ctx.dispatch(&Target::host(host)?, &command).await
}

/// Re-apply the NIC's extra addresses on the instance's host
/// (`apply_second_ips.sh`).
pub async fn apply_second_ips(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    nic: &Nic,
    mac: &str,
    os_code: &str,
) -> HandlerResult<()> {
    if instance.hyper < 0 {
        return Err(HandlerError::HostUnavailable(format!(
            "instance {} is not placed",
            instance.id
        )));
    }
    let command = ctx
        .script("apply_second_ips.sh")
        .arg(instance.id)
        .arg(mac)
        .arg(os_code)
        .arg(true)
        .payload(&more_addresses(instance, nic))?;
    ctx.dispatch(&Target::host(instance.hyper)?, &command).await
}
