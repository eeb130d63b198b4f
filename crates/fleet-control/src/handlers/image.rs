//! Image reports: `capture_image`, `create_image`, `sync_image_info`.
//!
//! An image lives in one or more storage pools. Each pooled copy is an
//! [`ImageStorage`] row that starts out `syncing` and turns `synced` once a
//! backend reports the volume holding it.

use std::collections::BTreeMap;

use fleet_core::{Image, ImageStorage, ResourceEvent, ResourceType, StorageStatus};
use fleet_exec::Target;
use tracing::{info, warn};

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};

async fn image(ctx: &mut HandlerCtx<'_>, id: i64) -> HandlerResult<Image> {
    ctx.tx
        .image(id)
        .await?
        .ok_or_else(|| HandlerError::not_found("image", id))
}

async fn write(ctx: &mut HandlerCtx<'_>, image: &Image, previous: &str) -> HandlerResult<()> {
    ctx.tx.update_image(image.clone()).await?;
    if image.status != previous {
        ctx.emit(
            ResourceEvent::new(ResourceType::Image, image.id, image.status.as_str())
                .with_previous(previous),
        );
    }
    Ok(())
}

/// `capture_image '<image>' '<status>' '<format>' '<size|message>' '<volume>' '<storage>'`
///
/// On the `local` driver the backend reports format and size of the
/// captured file; on a failed capture the fourth value is the error text.
pub async fn capture_image(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(7)?;
    let mut image = image(ctx, args.id(1, "image")?).await?;
    let previous = std::mem::take(&mut image.status);
    image.status = args.str(2)?.to_string();
    if image.status == "error" {
        warn!(image = image.id, message = args.str(4)?, "Image capture failed");
    } else if ctx.settings().volume_driver == "local" {
        image.format = args.str(3)?.to_string();
        image.size = args.parse(4, "size")?;
    }
    write(ctx, &image, &previous).await?;

    let storage_id = args.id(6, "storage")?;
    if storage_id > 0 {
        let mut storage = ctx
            .tx
            .image_storage(storage_id)
            .await?
            .ok_or_else(|| HandlerError::not_found("image storage", storage_id))?;
        storage.volume_id = args.str(5)?.to_string();
        storage.status = if image.status == "available" {
            StorageStatus::Synced
        } else {
            StorageStatus::Error
        };
        ctx.tx.save_image_storage(storage).await?;
    }
    info!(image = image.id, status = %image.status, storage = storage_id, "Image captured");
    Ok(image.status)
}

/// `create_image '<image>' '<status>' '<format>' '<size>' '<pool>' '<volume>'`
///
/// The first pooled copy is ready. Every other pool still waiting for the
/// image gets a `clone_image.sh` from that copy, run wherever the executor
/// chooses.
pub async fn create_image(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(7)?;
    let mut image = image(ctx, args.id(1, "image")?).await?;
    let previous = std::mem::take(&mut image.status);
    image.status = args.str(2)?.to_string();
    image.format = args.str(3)?.to_string();
    image.size = args.parse(4, "size")?;
    write(ctx, &image, &previous).await?;

    let pool = args.str(5)?;
    let volume = args.str(6)?;
    let storages = ctx.tx.image_storages(image.id).await?;
    let mut source = storages
        .iter()
        .find(|s| s.pool_id == pool)
        .cloned()
        .ok_or_else(|| HandlerError::not_found("image storage", format!("{}/{pool}", image.id)))?;
    source.volume_id = volume.to_string();
    source.status = StorageStatus::Synced;
    let source = ctx.tx.save_image_storage(source).await?;

    let mut deferred = Deferred::new();
    let mut clones = 0;
    for pending in storages
        .iter()
        .filter(|s| s.id != source.id && s.status == StorageStatus::Syncing)
    {
        let cmd = ctx
            .script("clone_image.sh")
            .arg(pending.id)
            .arg(image.id)
            .arg(image.volume_prefix())
            .arg(pool)
            .arg(volume)
            .arg(&pending.pool_id)
            .arg("snap");
        if deferred
            .absorb(ctx.dispatch(&Target::Any, &cmd).await)?
            .is_some()
        {
            clones += 1;
        }
    }
    info!(image = image.id, pool, clones, "Image created");
    deferred.finish(image.status)
}

/// Parse `pool1,vol1;pool2,vol2`. Malformed pairs are skipped.
fn parse_pool_volumes(raw: &str) -> BTreeMap<&str, &str> {
    raw.split(';')
        .filter_map(|pair| {
            let mut parts = pair.split(',');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(pool), Some(volume), None) if !pool.is_empty() => Some((pool, volume)),
                _ => None,
            }
        })
        .collect()
}

/// `sync_image_info '<image>' '<pool>,<volume>;...'`: the full list of pools
/// holding the image. Rows for other pools are dropped.
pub async fn sync_image_info(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(3)?;
    let image = image(ctx, args.id(1, "image")?).await?;
    let mut reported = parse_pool_volumes(args.str(2)?);

    let (mut kept, mut removed) = (0, 0);
    for mut storage in ctx.tx.image_storages(image.id).await? {
        match reported.remove(storage.pool_id.as_str()) {
            Some(volume) => {
                storage.volume_id = volume.to_string();
                storage.status = StorageStatus::Synced;
                ctx.tx.save_image_storage(storage).await?;
                kept += 1;
            }
            None => {
                ctx.tx.delete_image_storage(storage.id).await?;
                removed += 1;
            }
        }
    }
    let added = reported.len();
    for (pool, volume) in reported {
        let storage = ImageStorage {
            id: 0,
            image_id: image.id,
            pool_id: pool.to_string(),
            volume_id: volume.to_string(),
            status: StorageStatus::Synced,
        };
        ctx.tx.save_image_storage(storage).await?;
    }
    info!(image = image.id, kept, removed, added, "Image storage synced");
    Ok(image.status)
}
