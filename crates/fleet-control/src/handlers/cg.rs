//! Consistency group reports from the `wds_vhost` backend.
//!
//! Group operations report `available` (or `deleted`) on success; anything
//! else puts the row into `error`. Snapshot create and restore also release
//! the member volumes, which were held in a transient status while the
//! backend worked.

use fleet_core::{
    CgSnapshot, CgSnapshotStatus, CgStatus, ConsistencyGroup, ResourceEvent, ResourceType,
    VolumeStatus, bytes_to_gib,
};
use fleet_store::VolumeUpdate;
use tracing::{info, warn};

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::{HandlerError, HandlerResult};

async fn group(ctx: &mut HandlerCtx<'_>, id: i64) -> HandlerResult<ConsistencyGroup> {
    ctx.tx
        .consistency_group(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("consistency group", id))
}

async fn snapshot(ctx: &mut HandlerCtx<'_>, id: i64) -> HandlerResult<CgSnapshot> {
    ctx.tx
        .cg_snapshot(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("cg snapshot", id))
}

async fn write_group(
    ctx: &mut HandlerCtx<'_>,
    cg: ConsistencyGroup,
    previous: CgStatus,
) -> HandlerResult<String> {
    let status = cg.status;
    ctx.tx.update_consistency_group(cg.clone()).await?;
    if status != previous {
        ctx.emit(
            ResourceEvent::new(ResourceType::ConsistencyGroup, cg.id, status.as_str())
                .with_previous(previous.as_str()),
        );
    }
    info!(cg = cg.id, status = %status, "Consistency group updated");
    Ok(status.to_string())
}

async fn write_snapshot(
    ctx: &mut HandlerCtx<'_>,
    snap: CgSnapshot,
    previous: CgSnapshotStatus,
) -> HandlerResult<()> {
    let status = snap.status;
    let id = snap.id;
    ctx.tx.update_cg_snapshot(snap).await?;
    if status != previous {
        ctx.emit(
            ResourceEvent::new(ResourceType::CgSnapshot, id, status.as_str())
                .with_previous(previous.as_str()),
        );
    }
    Ok(())
}

/// Put every member volume back to `attached` or `available`.
async fn release_volumes(ctx: &mut HandlerCtx<'_>, cg_id: i64) -> HandlerResult<usize> {
    let members = ctx.tx.cg_volumes(cg_id).await?;
    for member in &members {
        let volume = ctx
            .tx
            .volume(member.volume_id)
            .await?
            .ok_or_else(|| HandlerError::not_found("volume", member.volume_id))?;
        let status = if volume.instance_id > 0 {
            VolumeStatus::Attached
        } else {
            VolumeStatus::Available
        };
        if status == volume.status {
            continue;
        }
        ctx.tx
            .update_volume(volume.id, VolumeUpdate::status(status))
            .await?;
        ctx.emit(
            ResourceEvent::new(ResourceType::Volume, volume.id, status.as_str())
                .with_previous(volume.status.as_str()),
        );
    }
    Ok(members.len())
}

/// `create_cg_wds '<cg>' '<status>' '<wds_cg_id>' '<message>'`
pub async fn create_cg(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(5)?;
    let mut cg = group(ctx, args.id(1, "cg")?).await?;
    let previous = cg.status;
    if args.str(2)? == "available" {
        cg.status = CgStatus::Available;
        cg.wds_cg_id = args.str(3)?.to_string();
    } else {
        warn!(cg = cg.id, message = args.str(4)?, "Consistency group creation failed");
        cg.status = CgStatus::Error;
    }
    write_group(ctx, cg, previous).await
}

/// `delete_cg_wds '<cg>' '<status>' '<message>'`
pub async fn delete_cg(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(4)?;
    let mut cg = group(ctx, args.id(1, "cg")?).await?;
    let previous = cg.status;
    if args.str(2)? == "deleted" {
        ctx.tx.delete_consistency_group(cg.id).await?;
        ctx.emit(
            ResourceEvent::new(ResourceType::ConsistencyGroup, cg.id, "deleted")
                .with_previous(previous.as_str()),
        );
        info!(cg = cg.id, "Consistency group deleted");
        return Ok("deleted".to_string());
    }
    warn!(cg = cg.id, message = args.str(3)?, "Consistency group deletion failed");
    cg.status = CgStatus::Error;
    write_group(ctx, cg, previous).await
}

/// `add_volumes_to_cg_wds` and `remove_volumes_from_cg_wds`:
/// `'<cg>' '<status>' '<message>'`. Membership rows are managed by the
/// requester; only the group status follows the backend.
pub async fn membership_changed(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(4)?;
    let mut cg = group(ctx, args.id(1, "cg")?).await?;
    let previous = cg.status;
    if args.str(2)? == "available" {
        cg.status = CgStatus::Available;
    } else {
        warn!(
            cg = cg.id,
            command = args.command(),
            message = args.str(3)?,
            "Consistency group update failed"
        );
        cg.status = CgStatus::Error;
    }
    write_group(ctx, cg, previous).await
}

/// `create_cg_snapshot_wds '<snapshot>' '<status>' '<wds_snap_id>' '<size_bytes>' '<message>'`
pub async fn create_cg_snapshot(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(6)?;
    let mut snap = snapshot(ctx, args.id(1, "snapshot")?).await?;
    let previous = snap.status;
    if args.str(2)? == "available" {
        // An unreadable size is recorded as 0 rather than failing the snapshot.
        let bytes = args.str(4)?.trim().parse().unwrap_or(0);
        snap.status = CgSnapshotStatus::Available;
        snap.wds_snap_id = args.str(3)?.to_string();
        snap.size = bytes_to_gib(bytes);
    } else {
        warn!(snapshot = snap.id, message = args.str(5)?, "CG snapshot creation failed");
        snap.status = CgSnapshotStatus::Error;
    }
    snap.task_id = 0;
    let (cg_id, status) = (snap.cg_id, snap.status);
    write_snapshot(ctx, snap, previous).await?;
    let volumes = release_volumes(ctx, cg_id).await?;
    info!(cg = cg_id, status = %status, volumes, "CG snapshot created");
    Ok(status.to_string())
}

/// `delete_cg_snapshot_wds '<snapshot>' '<status>' '<message>'`
pub async fn delete_cg_snapshot(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(4)?;
    let mut snap = snapshot(ctx, args.id(1, "snapshot")?).await?;
    let previous = snap.status;
    if args.str(2)? == "deleted" {
        ctx.tx.delete_cg_snapshot(snap.id).await?;
        ctx.emit(
            ResourceEvent::new(ResourceType::CgSnapshot, snap.id, "deleted")
                .with_previous(previous.as_str()),
        );
        info!(snapshot = snap.id, cg = snap.cg_id, "CG snapshot deleted");
        return Ok("deleted".to_string());
    }
    warn!(snapshot = snap.id, message = args.str(3)?, "CG snapshot deletion failed");
    snap.status = CgSnapshotStatus::Error;
    write_snapshot(ctx, snap, previous).await?;
    Ok(CgSnapshotStatus::Error.to_string())
}

/// `restore_cg_snapshot_wds '<snapshot>' '<cg>' '<status>' '<message>'`
pub async fn restore_cg_snapshot(
    ctx: &mut HandlerCtx<'_>,
    args: Args<'_>,
) -> HandlerResult<String> {
    let args = args.require(5)?;
    let mut snap = snapshot(ctx, args.id(1, "snapshot")?).await?;
    let cg_id = args.id(2, "cg")?;
    let previous = snap.status;
    if args.str(3)? == "available" {
        snap.status = CgSnapshotStatus::Available;
    } else {
        warn!(snapshot = snap.id, message = args.str(4)?, "CG snapshot restore failed");
        snap.status = CgSnapshotStatus::Error;
    }
    snap.task_id = 0;
    let status = snap.status;
    write_snapshot(ctx, snap, previous).await?;
    let volumes = release_volumes(ctx, cg_id).await?;
    info!(cg = cg_id, status = %status, volumes, "CG snapshot restored");
    Ok(status.to_string())
}
