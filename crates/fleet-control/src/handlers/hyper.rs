//! `hyper_status`: periodic host heartbeat with capacity counters.

use std::str::FromStr;

use fleet_core::{HYPER_UP, HostId, Hyper, Resource, ResourceEvent, ResourceType};
use tracing::{debug, info};

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::HandlerResult;

const VIRT_TYPE: &str = "kvm-x86_64";

/// One heartbeat. Counters the agent could not measure arrive as garbage
/// and are read as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperReport {
    pub hostid: HostId,
    pub hostname: String,
    pub resource: Resource,
    pub status: i32,
    pub host_ip: String,
    pub zone: String,
    pub cpu_over_rate: Option<f32>,
    pub mem_over_rate: Option<f32>,
    pub disk_over_rate: Option<f32>,
    pub cpu_model: String,
}

fn lenient<T: FromStr>(args: &Args<'_>, index: usize, name: &str) -> HandlerResult<Option<T>> {
    let raw = args.str(index)?;
    let value = raw.trim().parse().ok();
    if value.is_none() {
        debug!(field = name, raw, "Unreadable heartbeat field");
    }
    Ok(value)
}

impl HyperReport {
    pub fn parse(args: Args<'_>) -> HandlerResult<Self> {
        let args = args.require(16)?;
        let hostid = args.host(1, "hostid")?;
        if hostid < 0 {
            return Err(args.invalid(format!("hostid {hostid}")));
        }
        let counter = |i: usize, name: &str| lenient::<i64>(&args, i, name).map(|v| v.unwrap_or(0));
        Ok(Self {
            hostid,
            hostname: args.str(2)?.to_string(),
            resource: Resource {
                hostid,
                cpu: counter(3, "cpu")?,
                cpu_total: counter(4, "cpu_total")?,
                memory: counter(5, "memory")?,
                memory_total: counter(6, "memory_total")?,
                disk: counter(7, "disk")?,
                disk_total: counter(8, "disk_total")?,
            },
            status: lenient(&args, 9, "status")?.unwrap_or(HYPER_UP),
            host_ip: args.str(10)?.to_string(),
            zone: args.str(11)?.to_string(),
            cpu_over_rate: lenient(&args, 12, "cpu_over_rate")?,
            mem_over_rate: lenient(&args, 13, "mem_over_rate")?,
            disk_over_rate: lenient(&args, 14, "disk_over_rate")?,
            cpu_model: args.str(15)?.to_string(),
        })
    }
}

pub async fn hyper_status(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let report = HyperReport::parse(args)?;
    let zone_id = if report.zone.is_empty() {
        0
    } else {
        ctx.tx.zone_or_create(&report.zone).await?.id
    };

    let existing = ctx.tx.hyper(report.hostid).await?;
    let previous = existing.as_ref().map(|h| h.status);
    let mut hyper = existing
        .unwrap_or_else(|| Hyper::new(report.hostid, &report.hostname, &report.host_ip));
    hyper.hostname = report.hostname.clone();
    hyper.host_ip = report.host_ip.clone();
    hyper.status = report.status;
    hyper.zone_id = zone_id;
    hyper.virt_type = VIRT_TYPE.to_string();
    hyper.cpu_model = report.cpu_model.clone();
    if let Some(rate) = report.cpu_over_rate {
        hyper.cpu_over_rate = rate;
    }
    if let Some(rate) = report.mem_over_rate {
        hyper.mem_over_rate = rate;
    }
    if let Some(rate) = report.disk_over_rate {
        hyper.disk_over_rate = rate;
    }
    let up = hyper.is_up();
    ctx.tx.upsert_hyper(hyper).await?;
    ctx.tx.upsert_resource(report.resource.clone()).await?;

    if previous != Some(report.status) {
        let status = if up { "up" } else { "down" };
        let event = ResourceEvent::new(ResourceType::Hyper, i64::from(report.hostid), status);
        ctx.emit(match previous {
            Some(HYPER_UP) => event.with_previous("up"),
            Some(_) => event.with_previous("down"),
            None => event,
        });
        info!(host = report.hostid, status, zone = zone_id, "Hypervisor status changed");
    }
    Ok(report.status.to_string())
}
