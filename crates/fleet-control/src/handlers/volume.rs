//! Volume reports: `attach_volume*`, `create_volume`, `resize_volume` and
//! `vol_snapshot_wds_vhost`.

use fleet_core::{ResourceEvent, ResourceType, Volume, VolumeStatus};
use fleet_store::VolumeUpdate;
use tracing::{info, warn};

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::{HandlerError, HandlerResult};

async fn volume(ctx: &mut HandlerCtx<'_>, id: i64) -> HandlerResult<Volume> {
    ctx.tx
        .volume(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("volume", id))
}

async fn write(
    ctx: &mut HandlerCtx<'_>,
    volume: &Volume,
    update: VolumeUpdate,
) -> HandlerResult<String> {
    let status = update.status.unwrap_or(volume.status);
    ctx.tx.update_volume(volume.id, update).await?;
    if status != volume.status {
        ctx.emit(
            ResourceEvent::new(ResourceType::Volume, volume.id, status.as_str())
                .with_previous(volume.status.as_str()),
        );
    }
    info!(volume = volume.id, status = %status, "Volume updated");
    Ok(status.to_string())
}

/// `attach_volume '<volume>'` after a failed attach, or
/// `attach_volume '<instance>' '<volume>' '<target>'` once the guest sees it.
pub async fn attach_volume(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    if args.len() == 2 {
        let volume = volume(ctx, args.id(1, "volume")?).await?;
        return write(ctx, &volume, VolumeUpdate::detached()).await;
    }
    let args = args.require(4)?;
    let instance_id = args.id(1, "instance")?;
    if instance_id <= 0 {
        return Err(args.invalid(format!("instance {instance_id}")));
    }
    let volume = volume(ctx, args.id(2, "volume")?).await?;
    let update = VolumeUpdate {
        status: Some(VolumeStatus::Attached),
        path: None,
        target: Some(args.str(3)?.to_string()),
        instance_id: Some(instance_id),
    };
    write(ctx, &volume, update).await
}

/// `create_volume '<volume>' '<path>' '<status>'`
pub async fn create_volume(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(4)?;
    let volume = volume(ctx, args.id(1, "volume")?).await?;
    let status: VolumeStatus = args.parse(3, "status")?;
    if status.is_attach_class() && volume.instance_id == 0 {
        return Err(HandlerError::protocol(format!(
            "volume {} reported '{status}' without an instance",
            volume.id
        )));
    }
    let update = VolumeUpdate {
        status: Some(status),
        path: Some(args.str(2)?.to_string()),
        ..VolumeUpdate::default()
    };
    write(ctx, &volume, update).await
}

/// `resize_volume '<volume>' '<status>'`: anything but `error` puts the
/// volume back where it was before the resize.
pub async fn resize_volume(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(3)?;
    let volume = volume(ctx, args.id(1, "volume")?).await?;
    let reported = args.str(2)?;
    let status = if reported == VolumeStatus::Error.as_str() {
        VolumeStatus::Error
    } else if volume.instance_id > 0 {
        VolumeStatus::Attached
    } else {
        VolumeStatus::Available
    };
    write(ctx, &volume, VolumeUpdate::status(status)).await
}

/// `vol_snapshot_wds_vhost '<backup>' '<status>' '<path>' '<message>'`.
/// Empty values leave the stored ones alone.
pub async fn volume_snapshot(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(5)?;
    let id = args.id(1, "backup")?;
    let mut backup = ctx
        .tx
        .backup(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("backup", id))?;
    let previous = backup.status.clone();
    let (status, path) = (args.str(2)?, args.str(3)?);
    if !status.is_empty() {
        backup.status = status.to_string();
    }
    if !path.is_empty() {
        backup.path = path.to_string();
    }
    if backup.status == "error" {
        warn!(backup = id, message = args.str(4)?, "Volume snapshot failed");
    }
    ctx.tx.update_backup(backup.clone()).await?;
    if backup.status != previous {
        ctx.emit(
            ResourceEvent::new(ResourceType::Backup, id, backup.status.as_str())
                .with_previous(previous),
        );
    }
    info!(backup = id, volume = backup.volume_id, status = %backup.status, "Backup updated");
    Ok(backup.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use fleet_exec::RecordingGateway;
    use fleet_store::{MemoryStore, StateStore, fixture};

    async fn run(store: &MemoryStore, values: &[&str]) -> HandlerResult<String> {
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let values: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        let args = Args::new(&values);
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let result = match values[0].as_str() {
            "create_volume" => create_volume(&mut ctx, args).await,
            "resize_volume" => resize_volume(&mut ctx, args).await,
            "vol_snapshot_wds_vhost" => volume_snapshot(&mut ctx, args).await,
            _ => attach_volume(&mut ctx, args).await,
        };
        let (tx, _) = ctx.into_parts();
        match &result {
            Err(e) if e.rolls_back() => tx.rollback().await.unwrap(),
            _ => tx.commit().await.unwrap(),
        }
        assert!(gateway.dispatches().is_empty());
        result
    }

    fn fleet() -> MemoryStore {
        fixture::fleet()
            .hyper(7, "10.1.0.7")
            .instance(42, 0, 7)
            .volume(1, 0, false)
            .volume(2, 42, false)
            .backup(3, 1, "pending")
            .build()
    }

    #[tokio::test]
    async fn test_attach_binds_volume() {
        let store = fleet();
        let status = run(&store, &["attach_volume_local", "42", "1", "vdc"])
            .await
            .unwrap();
        assert_eq!(status, "attached");
        let snap = store.snapshot().await;
        let volume = snap.volume(1).unwrap();
        assert_eq!(volume.instance_id, 42);
        assert_eq!(volume.target, "vdc");
        assert!(volume.is_consistent());
    }

    #[tokio::test]
    async fn test_attach_single_arg_releases() {
        let store = fleet();
        run(&store, &["attach_volume", "2"]).await.unwrap();
        let snap = store.snapshot().await;
        let volume = snap.volume(2).unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert_eq!(volume.instance_id, 0);
        assert!(volume.is_consistent());
    }

    #[tokio::test]
    async fn test_attach_short_args() {
        let store = fleet();
        let err = run(&store, &["attach_volume_wds_vhost", "42", "1"])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn test_create_volume_sets_path() {
        let store = fleet();
        run(
            &store,
            &["create_volume", "1", "wds_vhost://pool-1/vol-77", "available"],
        )
        .await
        .unwrap();
        let snap = store.snapshot().await;
        let volume = snap.volume(1).unwrap();
        assert_eq!(volume.path, "wds_vhost://pool-1/vol-77");
        assert_eq!(volume.origin_volume_id(), "vol-77");
    }

    #[tokio::test]
    async fn test_create_volume_rejects_unbound_attach() {
        let store = fleet();
        let err = run(&store, &["create_volume", "1", "/volume-1.disk", "attached"])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_resize_restores_status() {
        let store = fleet();
        assert_eq!(run(&store, &["resize_volume", "1", "resized"]).await.unwrap(), "available");
        assert_eq!(run(&store, &["resize_volume", "2", "resized"]).await.unwrap(), "attached");
        assert_eq!(run(&store, &["resize_volume", "1", "error"]).await.unwrap(), "error");
    }

    #[tokio::test]
    async fn test_volume_snapshot_records_path() {
        let store = fleet();
        let status = run(
            &store,
            &["vol_snapshot_wds_vhost", "3", "available", "wds_vhost://pool-1/snap-3", ""],
        )
        .await
        .unwrap();
        assert_eq!(status, "available");
        let snap = store.snapshot().await;
        let backup = snap.backups.iter().find(|b| b.id == 3).unwrap();
        assert_eq!(backup.path, "wds_vhost://pool-1/snap-3");
    }

    #[tokio::test]
    async fn test_volume_snapshot_empty_values_keep_row() {
        let store = fleet();
        run(&store, &["vol_snapshot_wds_vhost", "3", "", "", "still running"])
            .await
            .unwrap();
        let snap = store.snapshot().await;
        let backup = snap.backups.iter().find(|b| b.id == 3).unwrap();
        assert_eq!(backup.status, "pending");
        assert!(backup.path.is_empty());
    }

    #[tokio::test]
    async fn test_volume_snapshot_unknown_backup() {
        let store = fleet();
        let err = run(&store, &["vol_snapshot_wds_vhost", "99", "error", "", "gone"])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound { .. }));
    }
}
