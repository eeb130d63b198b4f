//! Migration orchestration.
//!
//! A migration advances one phase per remote report:
//! `pending -> target_prepared -> source_prepared -> completed`, or to
//! `failed` from anywhere. Each report writes the migration row first and the
//! reporting task second, inside the callback's transaction. Completed and
//! failed migrations reject every later report before any write.

use fleet_core::migration::PREPARE_SOURCE_TASK;
use fleet_core::{
    HostId, Instance, InstanceStatus, Migration, MigrationStatus, ResourceEvent, ResourceType,
    Task, TaskStatus, VolumeInfo,
};
use fleet_exec::Target;
use fleet_store::{InstanceUpdate, MigrationUpdate};
use tracing::{info, warn};

use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};
use crate::handlers::instance::{LaunchReport, apply_launch};
use crate::{netinfo, reconciler};

const PREPARE_SOURCE_SUMMARY: &str = "Prepare resources on source hypervisor";

/// A `migrate_vm` report from one side of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migration_id: i64,
    pub task_id: i64,
    pub instance_id: i64,
    pub hyper: HostId,
    pub status: MigrationStatus,
}

/// Hand the source host its half of the migration: release the instance and
/// export its volumes. `task_id` is the task the source will report back on.
pub async fn exec_source_migrate(
    ctx: &mut HandlerCtx<'_>,
    migration: &Migration,
    instance: &Instance,
    task_id: i64,
    kind: &str,
) -> HandlerResult<()> {
    let target = ctx
        .tx
        .hyper(migration.target_hyper)
        .await?
        .ok_or_else(|| HandlerError::not_found("target hyper", migration.target_hyper))?;
    let source = ctx
        .tx
        .hyper(migration.source_hyper)
        .await?
        .ok_or_else(|| HandlerError::not_found("source hyper", migration.source_hyper))?;

    let volumes: Vec<VolumeInfo> = ctx
        .tx
        .volumes_of_instance(instance.id)
        .await?
        .iter()
        .map(|v| VolumeInfo {
            id: v.id,
            uuid: v.origin_volume_id().to_string(),
            device: v.target.clone(),
            booting: v.booting,
        })
        .collect();

    if !source.is_up() {
        return Err(HandlerError::HostUnavailable(format!(
            "source hyper {} is not up",
            source.hostid
        )));
    }

    let command = ctx
        .script("source_migration.sh")
        .arg(migration.id)
        .arg(task_id)
        .arg(instance.id)
        .arg(instance.router_id)
        .arg(&target.hostname)
        .arg(kind)
        .payload(&volumes)?;
    ctx.dispatch(&Target::host(source.hostid)?, &command).await?;
    info!(
        migration = migration.id,
        task = task_id,
        source = source.hostid,
        target = %target.hostname,
        volumes = volumes.len(),
        "Requested source preparation"
    );
    Ok(())
}

/// Re-issue every failed source preparation of the latest migration away
/// from the instance's current host. Returns how many were re-issued.
pub async fn replay_failed_prepare(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
) -> HandlerResult<usize> {
    let Some(migration) = ctx
        .tx
        .latest_migration_from(instance.id, instance.hyper)
        .await?
    else {
        return Ok(0);
    };
    let failed = ctx
        .tx
        .tasks_of_migration(migration.id, PREPARE_SOURCE_TASK, TaskStatus::Failed)
        .await?;
    for task in &failed {
        warn!(migration = migration.id, task = task.id, "Replaying failed source preparation");
        exec_source_migrate(ctx, &migration, instance, task.id, "cold").await?;
    }
    Ok(failed.len())
}

/// Status the reporting task ends with. A `target_prepared` report completes
/// its task even when the source could not be reached.
fn task_status_for(status: MigrationStatus) -> TaskStatus {
    match status {
        MigrationStatus::Failed => TaskStatus::Failed,
        _ => TaskStatus::Completed,
    }
}

async fn set_instance_status(
    ctx: &mut HandlerCtx<'_>,
    instance: &Instance,
    status: InstanceStatus,
) -> HandlerResult<()> {
    ctx.tx
        .update_instance(instance.id, InstanceUpdate::status(status))
        .await?;
    if instance.status != status {
        ctx.emit(
            ResourceEvent::new(ResourceType::Instance, instance.id, status.as_str())
                .with_previous(instance.status.as_str()),
        );
    }
    Ok(())
}

async fn on_target_prepared(
    ctx: &mut HandlerCtx<'_>,
    migration: &mut Migration,
    instance: &Instance,
    hyper: HostId,
) -> HandlerResult<MigrationStatus> {
    ctx.tx
        .hyper(hyper)
        .await?
        .ok_or_else(|| HandlerError::not_found("hyper", hyper))?;
    migration.target_hyper = hyper;

    let task = ctx
        .tx
        .create_task(Task::new(
            migration.id,
            PREPARE_SOURCE_TASK,
            PREPARE_SOURCE_SUMMARY,
            TaskStatus::InProgress,
        ))
        .await?;

    let kind = migration.kind.as_str();
    match exec_source_migrate(ctx, migration, instance, task.id, kind).await {
        Ok(()) => Ok(MigrationStatus::TargetPrepared),
        Err(HandlerError::Store(e)) => Err(HandlerError::Store(e)),
        Err(e) => {
            warn!(migration = migration.id, error = %e, "Source preparation could not be requested, failing migration");
            Ok(MigrationStatus::Failed)
        }
    }
}

async fn on_source_prepared(
    ctx: &mut HandlerCtx<'_>,
    migration: &Migration,
    instance: &Instance,
    deferred: &mut Deferred,
) -> HandlerResult<()> {
    let nics = ctx.tx.instance_nics(instance.id).await?;
    let Some(primary) = nics.iter().find(|n| n.interface.primary_if) else {
        warn!(instance = instance.id, "Instance has no primary interface, nothing to clear on source");
        return Ok(());
    };
    let source = migration.source_hyper;
    if instance.is_vpc() {
        deferred.absorb(reconciler::clear_floating_ips(ctx, instance, primary, source).await)?;
    }
    if !primary.site_subnets.is_empty() || !primary.second_addresses.is_empty() {
        deferred.absorb(netinfo::clear_second_ips(ctx, instance, primary, source).await)?;
    }
    Ok(())
}

/// Apply a migration report. Returns the status the migration now has.
pub async fn on_report(
    ctx: &mut HandlerCtx<'_>,
    report: MigrationReport,
) -> HandlerResult<MigrationStatus> {
    let mut migration = ctx
        .tx
        .migration(report.migration_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("migration", report.migration_id))?;
    if migration.status.is_terminal() {
        return Err(HandlerError::protocol(format!(
            "migration {} is already {}, ignoring '{}' report",
            migration.id, migration.status, report.status
        )));
    }
    let instance = ctx
        .tx
        .instance(report.instance_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", report.instance_id))?;

    let mut deferred = Deferred::new();
    let status = match report.status {
        MigrationStatus::Completed => {
            set_instance_status(ctx, &instance, InstanceStatus::Running).await?;
            let sync = LaunchReport::sync(instance.id, report.hyper);
            deferred.absorb(apply_launch(ctx, &sync).await)?;
            MigrationStatus::Completed
        }
        MigrationStatus::Failed => {
            set_instance_status(ctx, &instance, InstanceStatus::Unknown).await?;
            MigrationStatus::Failed
        }
        MigrationStatus::TargetPrepared => {
            on_target_prepared(ctx, &mut migration, &instance, report.hyper).await?
        }
        MigrationStatus::SourcePrepared => {
            on_source_prepared(ctx, &migration, &instance, &mut deferred).await?;
            MigrationStatus::SourcePrepared
        }
        MigrationStatus::Pending => {
            return Err(HandlerError::protocol(format!(
                "migration {}: 'pending' is not a reportable status",
                migration.id
            )));
        }
    };

    ctx.tx
        .update_migration(
            migration.id,
            MigrationUpdate {
                status: Some(status),
                target_hyper: (report.status == MigrationStatus::TargetPrepared)
                    .then_some(migration.target_hyper),
            },
        )
        .await?;
    if migration.status != status {
        ctx.emit(
            ResourceEvent::new(ResourceType::Migration, migration.id, status.as_str())
                .with_previous(migration.status.as_str()),
        );
    }

    let task_status = task_status_for(report.status);
    if ctx.tx.task(report.task_id).await?.is_some() {
        ctx.tx.update_task_status(report.task_id, task_status).await?;
    } else {
        warn!(migration = migration.id, task = report.task_id, "Reported task not found, skipping");
    }

    info!(
        migration = migration.id,
        instance = instance.id,
        from = %migration.status,
        to = %status,
        task = report.task_id,
        task_status = %task_status,
        "Migration advanced"
    );
    deferred.finish(status)
}
