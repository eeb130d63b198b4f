//! Instance lifecycle reports: `launch_vm`, `action_vm` and `clear_vm`.

use fleet_core::instance::{validate_report, validate_transition};
use fleet_core::{HostId, Instance, InstanceStatus, ResourceEvent, ResourceType};
use fleet_store::{InstanceUpdate, VolumeUpdate};
use tracing::{debug, info, warn};

use crate::address;
use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};
use crate::fdb;
use crate::migration;
use crate::netinfo;
use crate::reconciler;

/// Reason an agent gives when a host has just become authoritative for an
/// instance and the control plane should push everything again.
pub const SYNC_REASON: &str = "sync";

/// `launch_vm '<id>' '<status>' '<hyper>' '<reason>'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub instance_id: i64,
    pub status: InstanceStatus,
    pub hyper: HostId,
    pub reason: String,
}

impl LaunchReport {
    pub fn parse(args: Args<'_>) -> HandlerResult<Self> {
        let args = args.require(5)?;
        Ok(Self {
            instance_id: args.id(1, "instance")?,
            status: args.parse(2, "status")?,
            hyper: args.host(3, "hyper")?,
            reason: args.str(4)?.to_string(),
        })
    }

    /// The report a migration target implies once the instance runs there.
    pub fn sync(instance_id: i64, hyper: HostId) -> Self {
        Self {
            instance_id,
            status: InstanceStatus::Running,
            hyper,
            reason: SYNC_REASON.to_string(),
        }
    }

    fn is_sync(&self) -> bool {
        self.status == InstanceStatus::Running && self.reason == SYNC_REASON
    }
}

async fn mark_error(ctx: &mut HandlerCtx<'_>, instance_id: i64, reason: &str) -> HandlerResult<()> {
    let previous = ctx
        .tx
        .instance(instance_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", instance_id))?
        .status;
    ctx.tx
        .update_instance(
            instance_id,
            InstanceUpdate {
                status: Some(InstanceStatus::Error),
                reason: Some(reason.to_string()),
                ..InstanceUpdate::default()
            },
        )
        .await?;
    ctx.emit(
        ResourceEvent::new(ResourceType::Instance, instance_id, InstanceStatus::Error.as_str())
            .with_previous(previous.as_str()),
    );
    warn!(instance = instance_id, reason, "Instance placement failed");
    Ok(())
}

pub async fn launch_vm(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    if let Some(upstream) = ctx.upstream_error() {
        let instance_id = args.require(2)?.id(1, "instance")?;
        mark_error(ctx, instance_id, upstream).await?;
        return Ok(InstanceStatus::Error.to_string());
    }
    let report = LaunchReport::parse(args)?;
    if report.hyper < 0 {
        mark_error(ctx, report.instance_id, &report.reason).await?;
        return Ok(InstanceStatus::Error.to_string());
    }
    apply_launch(ctx, &report).await?;
    Ok(report.status.to_string())
}

/// Apply a placement report, and the full re-sync when the report says the
/// host just became authoritative.
///
/// A migrating instance keeps its row untouched; the migration reports own
/// it until they finish.
pub async fn apply_launch(ctx: &mut HandlerCtx<'_>, report: &LaunchReport) -> HandlerResult<()> {
    let instance = ctx
        .tx
        .instance(report.instance_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", report.instance_id))?;
    let hyper = ctx
        .tx
        .hyper(report.hyper)
        .await?
        .ok_or_else(|| HandlerError::not_found("hyper", report.hyper))?;

    let moved = instance.hyper != report.hyper;
    let updated = if instance.status == InstanceStatus::Migrating {
        debug!(instance = instance.id, "Instance is migrating, leaving its row to the migration");
        false
    } else {
        validate_report(instance.status, report.status, report.is_sync())
            .map_err(|e| HandlerError::protocol(format!("instance {}: {e}", instance.id)))?;
        ctx.tx
            .update_instance(
                instance.id,
                InstanceUpdate {
                    status: Some(report.status),
                    hyper: Some(report.hyper),
                    zone_id: Some(hyper.zone_id),
                    reason: Some(report.reason.clone()),
                },
            )
            .await?;
        ctx.tx
            .set_instance_interfaces_hyper(instance.id, report.hyper)
            .await?;
        if instance.status != report.status {
            ctx.emit(
                ResourceEvent::new(ResourceType::Instance, instance.id, report.status.as_str())
                    .with_previous(instance.status.as_str()),
            );
        }
        true
    };

    let current = Instance {
        hyper: report.hyper,
        zone_id: hyper.zone_id,
        ..instance
    };
    let announce = updated
        && current.is_vpc()
        && report.status == InstanceStatus::Running
        && (moved || report.is_sync());
    if !announce && !report.is_sync() {
        info!(instance = current.id, status = %report.status, host = report.hyper, "Instance placed");
        return Ok(());
    }

    let nics = ctx.tx.instance_nics(current.id).await?;
    let mut deferred = Deferred::new();
    if announce {
        deferred.absorb(fdb::propagate(ctx, current.router_id, report.hyper, &nics).await)?;
    }
    if report.is_sync() {
        deferred.absorb(migration::replay_failed_prepare(ctx, &current).await)?;
        deferred.absorb(netinfo::sync_nic_info(ctx, &current, &nics).await)?;
        if current.is_vpc() {
            deferred.absorb(reconciler::sync_floating_ips(ctx, &current, &nics).await)?;
        }
    }
    info!(
        instance = current.id,
        status = %report.status,
        host = report.hyper,
        sync = report.is_sync(),
        "Instance placed"
    );
    deferred.finish(())
}

/// `action_vm '<id>' '<status>'`: result of a power action.
pub async fn action_vm(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let args = args.require(3)?;
    let instance_id = args.id(1, "instance")?;
    let status: InstanceStatus = args.parse(2, "status")?;
    let instance = ctx
        .tx
        .instance(instance_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", instance_id))?;
    if instance.status == InstanceStatus::Migrating {
        debug!(instance = instance_id, reported = %status, "Ignoring power report during migration");
        return Ok(instance.status.to_string());
    }
    validate_transition(instance.status, status)
        .map_err(|e| HandlerError::protocol(format!("instance {instance_id}: {e}")))?;
    ctx.tx
        .update_instance(instance_id, InstanceUpdate::status(status))
        .await?;
    if instance.status != status {
        ctx.emit(
            ResourceEvent::new(ResourceType::Instance, instance_id, status.as_str())
                .with_previous(instance.status.as_str()),
        );
    }
    Ok(status.to_string())
}

/// `clear_vm '<id>'`: the host has destroyed the instance.
pub async fn clear_vm(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let instance_id = args.require(2)?.id(1, "instance")?;
    let instance = ctx
        .tx
        .instance(instance_id)
        .await?
        .ok_or_else(|| HandlerError::not_found("instance", instance_id))?;
    let nics = ctx.tx.instance_nics(instance_id).await?;

    let mut deferred = Deferred::new();
    deferred.absorb(fdb::withdraw(ctx, instance.router_id, instance.hyper, &nics).await)?;

    for nic in &nics {
        let id = nic.interface.id;
        address::release_interface(ctx.tx.as_mut(), id).await?;
        ctx.tx.clear_subnet_interface(id).await?;
        ctx.tx.delete_interface(id).await?;
        ctx.emit(ResourceEvent::new(ResourceType::Interface, id, "deleted"));
    }

    for volume in ctx.tx.volumes_of_instance(instance_id).await? {
        if volume.booting {
            continue;
        }
        ctx.tx.update_volume(volume.id, VolumeUpdate::detached()).await?;
        ctx.emit(
            ResourceEvent::new(ResourceType::Volume, volume.id, "available")
                .with_previous(volume.status.as_str()),
        );
    }

    ctx.tx.delete_instance(instance_id).await?;
    ctx.emit(
        ResourceEvent::new(ResourceType::Instance, instance_id, InstanceStatus::Deleted.as_str())
            .with_previous(instance.status.as_str()),
    );
    info!(instance = instance_id, interfaces = nics.len(), "Instance cleared");
    deferred.finish(InstanceStatus::Deleted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use fleet_core::{MigrationStatus, Task, TaskStatus, VolumeStatus};
    use fleet_core::migration::PREPARE_SOURCE_TASK;
    use fleet_exec::RecordingGateway;
    use fleet_store::{MemoryStore, StateStore, fixture};

    fn argv(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    async fn run(
        store: &MemoryStore,
        gateway: &RecordingGateway,
        values: &[&str],
        upstream: Option<&str>,
    ) -> HandlerResult<String> {
        let settings = ControlSettings::default();
        let values = argv(values);
        let args = Args::new(&values);
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, gateway, &settings, upstream);
        let result = match values[0].as_str() {
            "launch_vm" => launch_vm(&mut ctx, args).await,
            "action_vm" => action_vm(&mut ctx, args).await,
            _ => clear_vm(&mut ctx, args).await,
        };
        let (tx, _) = ctx.into_parts();
        match &result {
            Err(e) if e.rolls_back() => tx.rollback().await.unwrap(),
            _ => tx.commit().await.unwrap(),
        }
        result
    }

    /// Pending instance 42 on router 3 with two NICs; peers on hosts 9 and 11.
    fn fleet() -> fixture::FleetBuilder {
        fixture::fleet()
            .zone(2, "zone-b")
            .hyper_in_zone(7, "10.1.0.7", 2)
            .hyper(9, "10.1.0.9")
            .hyper(11, "10.1.0.11")
            .subnet(1, 5001, 3)
            .subnet(2, 5002, 3)
            .instance(42, 3, -1)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .nic(101, 42, 2, "172.16.2.10/24", false)
            .instance(43, 3, 9)
            .nic(110, 43, 1, "172.16.1.11/24", true)
            .instance(44, 3, 11)
            .nic(120, 44, 2, "172.16.2.12/24", true)
    }

    #[tokio::test]
    async fn test_launch_places_instance_and_interfaces() {
        let store = fleet().build();
        let gateway = RecordingGateway::new();
        let status = run(&store, &gateway, &["launch_vm", "42", "running", "7", "ok"], None)
            .await
            .unwrap();
        assert_eq!(status, "running");

        let snap = store.snapshot().await;
        let instance = snap.instance(42).unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.hyper, 7);
        assert_eq!(instance.zone_id, 2);
        assert_eq!(instance.reason, "ok");
        assert_eq!(snap.interface(100).unwrap().hyper, 7);
        assert_eq!(snap.interface(101).unwrap().hyper, 7);

        let fdb = gateway.of_script("add_fwrule.sh");
        assert_eq!(fdb.len(), 2);
        assert_eq!(fdb[0].target, "toall=group-fdb-7:9,11");
        assert_eq!(fdb[1].target, "inter=7");
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let store = fleet().build();
        let gateway = RecordingGateway::new();
        let report = ["launch_vm", "42", "running", "7", "ok"];
        run(&store, &gateway, &report, None).await.unwrap();
        let once = store.snapshot().await;
        run(&store, &gateway, &report, None).await.unwrap();
        assert_eq!(store.snapshot().await, once);
        // The second delivery does not move the instance, so nothing is re-sent.
        assert_eq!(gateway.of_script("add_fwrule.sh").len(), 2);
    }

    #[tokio::test]
    async fn test_launch_classic_never_propagates() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(1, 5001, 0)
            .instance(42, 0, -1)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .instance(43, 0, 9)
            .nic(110, 43, 1, "172.16.1.11/24", true)
            .build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["launch_vm", "42", "running", "7", "ok"], None)
            .await
            .unwrap();
        assert!(gateway.of_script("add_fwrule.sh").is_empty());
        assert!(gateway.of_script("del_fwrule.sh").is_empty());
    }

    #[tokio::test]
    async fn test_launch_upstream_error_marks_error() {
        let store = fleet().build();
        let gateway = RecordingGateway::new();
        let status = run(
            &store,
            &gateway,
            &["launch_vm", "42"],
            Some("Resource is not enough"),
        )
        .await
        .unwrap();
        assert_eq!(status, "error");
        let snap = store.snapshot().await;
        let instance = snap.instance(42).unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        assert_eq!(instance.reason, "Resource is not enough");
        assert_eq!(instance.hyper, -1);
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_launch_short_args_rejected() {
        let store = fleet().build();
        let before = store.snapshot().await;
        let gateway = RecordingGateway::new();
        let err = run(&store, &gateway, &["launch_vm", "42", "running"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters { .. }));
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_launch_skips_migrating_instance() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(1, 5001, 3)
            .instance(42, 3, 7)
            .instance_status(42, InstanceStatus::Migrating)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["launch_vm", "42", "running", "9", "ok"], None)
            .await
            .unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.instance(42).unwrap().status, InstanceStatus::Migrating);
        assert_eq!(snap.instance(42).unwrap().hyper, 7);
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_launch_stale_report_on_deleting() {
        let store = fleet().instance_status(42, InstanceStatus::Deleting).build();
        let gateway = RecordingGateway::new();
        let err = run(&store, &gateway, &["launch_vm", "42", "running", "7", "ok"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Protocol(_)));
        assert_eq!(
            store.snapshot().await.instance(42).unwrap().status,
            InstanceStatus::Deleting
        );
    }

    #[tokio::test]
    async fn test_launch_after_error_is_rejected() {
        let store = fleet().build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["launch_vm", "42", "error", "-1", "no host"], None)
            .await
            .unwrap();
        let err = run(&store, &gateway, &["launch_vm", "42", "running", "7", "ok"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Protocol(_)));
        let snap = store.snapshot().await;
        assert_eq!(snap.instance(42).unwrap().status, InstanceStatus::Error);
        assert_eq!(snap.instance(42).unwrap().hyper, -1);
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_sync_report_recovers_error() {
        let store = fleet()
            .instance(50, 3, 9)
            .instance_status(50, InstanceStatus::Unknown)
            .build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["launch_vm", "50", "running", "9", "sync"], None)
            .await
            .unwrap();
        assert_eq!(
            store.snapshot().await.instance(50).unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_launch_sync_pushes_everything() {
        let store = fleet()
            .public_subnet(5, 100)
            .floating_ip(1, 42, 5, "203.0.113.5/24", 300)
            .migration(5, 42, 7)
            .migration_status(5, MigrationStatus::Failed)
            .task(Task::new(5, PREPARE_SOURCE_TASK, "", TaskStatus::Failed))
            .build();
        // The failed migration was heading to host 9.
        {
            let mut tx = store.begin().await.unwrap();
            tx.update_migration(
                5,
                fleet_store::MigrationUpdate {
                    status: None,
                    target_hyper: Some(9),
                },
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["launch_vm", "42", "running", "7", "sync"], None)
            .await
            .unwrap();

        assert_eq!(gateway.of_script("add_fwrule.sh").len(), 2);
        assert_eq!(gateway.of_script("source_migration.sh").len(), 1);
        let nic_info = gateway.of_script("sync_nic_info.sh");
        assert_eq!(nic_info.len(), 1);
        assert_eq!(nic_info[0].target, "inter=7");
        assert_eq!(nic_info[0].payload().unwrap().as_array().unwrap().len(), 2);
        assert_eq!(gateway.of_script("create_floating.sh").len(), 1);
    }

    #[tokio::test]
    async fn test_action_vm_projects_status() {
        let store = fleet().instance(50, 3, 9).build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["action_vm", "50", "shut_off"], None)
            .await
            .unwrap();
        assert_eq!(
            store.snapshot().await.instance(50).unwrap().status,
            InstanceStatus::ShutOff
        );
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_action_vm_ignored_while_migrating() {
        let store = fleet()
            .instance(50, 3, 9)
            .instance_status(50, InstanceStatus::Migrating)
            .build();
        let gateway = RecordingGateway::new();
        let status = run(&store, &gateway, &["action_vm", "50", "paused"], None)
            .await
            .unwrap();
        assert_eq!(status, "migrating");
    }

    #[tokio::test]
    async fn test_action_vm_cannot_leave_error() {
        let store = fleet()
            .instance(50, 3, 9)
            .instance_status(50, InstanceStatus::Error)
            .build();
        let gateway = RecordingGateway::new();
        let err = run(&store, &gateway, &["action_vm", "50", "running"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Protocol(_)));
        assert_eq!(
            store.snapshot().await.instance(50).unwrap().status,
            InstanceStatus::Error
        );
    }

    #[tokio::test]
    async fn test_clear_vm_releases_everything() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(1, 5001, 3)
            .subnet(2, 5002, 3)
            .instance(42, 3, 7)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .nic(101, 42, 2, "172.16.2.10/24", false)
            .volume(1, 42, true)
            .volume(2, 42, false)
            .instance(43, 3, 9)
            .nic(110, 43, 1, "172.16.1.11/24", true)
            .build();
        let gateway = RecordingGateway::new();
        run(&store, &gateway, &["clear_vm", "42"], None).await.unwrap();

        let snap = store.snapshot().await;
        assert!(snap.instance(42).is_none());
        assert!(snap.interface(100).is_none());
        assert!(snap.interface(101).is_none());
        for address in snap.addresses.iter().filter(|a| a.address.ends_with(".10/24")) {
            assert!(!address.allocated);
            assert_eq!(address.interface, 0);
        }
        assert!(snap.addresses.iter().all(|a| a.is_consistent()));
        let data = snap.volume(2).unwrap();
        assert_eq!(data.status, VolumeStatus::Available);
        assert_eq!(data.instance_id, 0);
        assert_eq!(data.target, "");
        assert_eq!(snap.volume(1).unwrap().status, VolumeStatus::Attached);

        let withdrawn = gateway.of_script("del_fwrule.sh");
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].target, "toall=group-fdb-7:9");
        assert_eq!(withdrawn[0].payload().unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_vm_unknown_instance() {
        let store = fleet().build();
        let gateway = RecordingGateway::new();
        let err = run(&store, &gateway, &["clear_vm", "99"], None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "instance 99 not found");
    }
}
