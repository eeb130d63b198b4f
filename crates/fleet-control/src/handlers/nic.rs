//! Interface reports: `attach_vm_nic`, `detach_vm_nic`, `clear_second_ips`.

use fleet_core::{Instance, ResourceEvent, ResourceType};
use fleet_store::Nic;
use tracing::info;

use crate::address;
use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};
use crate::{fdb, netinfo, reconciler};

async fn instance(ctx: &mut HandlerCtx<'_>, id: i64) -> HandlerResult<Instance> {
    ctx.tx
        .instance(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", id))
}

/// `attach_vm_nic '<instance>' '<mac>'`: a hot-plugged NIC is up.
pub async fn attach_vm_nic(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(3)?;
    let instance = instance(ctx, args.id(1, "instance")?).await?;
    let mac = args.str(2)?;
    let nic = ctx
        .tx
        .nic_by_mac(instance.id, mac)
        .await?
        .ok_or_else(|| HandlerError::not_found("interface", mac))?;
    let nics = std::slice::from_ref(&nic);

    let mut deferred = Deferred::new();
    let outcome = deferred
        .absorb(fdb::propagate(ctx, instance.router_id, nic.interface.hyper, nics).await)?
        .unwrap_or_default();
    if nic.interface.primary_if && instance.is_vpc() {
        deferred.absorb(reconciler::sync_floating_ips(ctx, &instance, nics).await)?;
    }
    info!(
        instance = instance.id,
        interface = nic.interface.id,
        dispatches = outcome.dispatches,
        "Interface attached"
    );
    deferred.finish(String::new())
}

/// `detach_vm_nic '<instance>' '<interface>'`: a NIC was unplugged.
pub async fn detach_vm_nic(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(3)?;
    let instance = instance(ctx, args.id(1, "instance")?).await?;
    let interface_id = args.id(2, "interface")?;
    let nic: Nic = ctx
        .tx
        .nic(interface_id)
        .await?
        .filter(|n| n.interface.owned_by_instance(instance.id))
        .ok_or_else(|| HandlerError::not_found("interface", interface_id))?;

    let mut deferred = Deferred::new();
    deferred.absorb(
        fdb::withdraw(
            ctx,
            instance.router_id,
            instance.hyper,
            std::slice::from_ref(&nic),
        )
        .await,
    )?;
    let released = address::release_interface(ctx.tx.as_mut(), interface_id).await?;
    ctx.tx.clear_subnet_interface(interface_id).await?;
    ctx.tx.delete_interface(interface_id).await?;
    ctx.emit(ResourceEvent::new(ResourceType::Interface, interface_id, "deleted"));
    info!(instance = instance.id, interface = interface_id, released, "Interface detached");
    deferred.finish(String::new())
}

/// `clear_second_ips '<instance>' '<mac>' '<os_code>'`: the guest dropped its
/// second addresses; put back the ones it still owns.
pub async fn clear_second_ips(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(4)?;
    let instance = instance(ctx, args.id(1, "instance")?).await?;
    let mac = args.str(2)?;
    let os_code = args.str(3)?;
    let nics = ctx.tx.instance_nics(instance.id).await?;
    let primary = nics
        .iter()
        .find(|n| n.interface.primary_if)
        .ok_or_else(|| HandlerError::not_found("primary interface of instance", instance.id))?;
    netinfo::apply_second_ips(ctx, &instance, primary, mac, os_code).await?;
    Ok(String::new())
}
