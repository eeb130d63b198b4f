//! `set_vrrp_ip` / `create_keepalived_conf`: a host took a VRRP role.

use fleet_core::VrrpRole;

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::HandlerResult;
use crate::reconciler::{self, VrrpFlavor, VrrpReport};

fn parse(args: Args<'_>) -> HandlerResult<VrrpReport> {
    let args = args.require(4)?;
    let vrrp_id = args.id(1, "vrrp")?;
    let hyper = args.host(2, "hyper")?;
    if vrrp_id < 0 || hyper < 0 {
        return Err(args.invalid(format!("vrrp {vrrp_id} on hyper {hyper}")));
    }
    let role: VrrpRole = args.parse(3, "role")?;
    Ok(VrrpReport {
        vrrp_id,
        hyper,
        role,
    })
}

pub async fn role_report(
    ctx: &mut HandlerCtx<'_>,
    args: Args<'_>,
    flavor: VrrpFlavor,
) -> HandlerResult<String> {
    let report = parse(args)?;
    reconciler::vrrp_role_report(ctx, flavor, report).await?;
    Ok(report.role.to_string())
}
