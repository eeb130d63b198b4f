//! `migrate_vm '<migration>' '<task>' '<instance>' '<hyper>' '<status>'`

use crate::args::Args;
use crate::context::HandlerCtx;
use crate::error::HandlerResult;
use crate::migration::{self, MigrationReport};

fn parse(args: Args<'_>) -> HandlerResult<MigrationReport> {
    let args = args.require(6)?;
    Ok(MigrationReport {
        migration_id: args.id(1, "migration")?,
        task_id: args.id(2, "task")?,
        instance_id: args.id(3, "instance")?,
        hyper: args.host(4, "hyper")?,
        status: args.parse(5, "status")?,
    })
}

pub async fn migrate_vm(ctx: &mut HandlerCtx<'_>, args: Args<'_>) -> HandlerResult<String> {
    let report = parse(args)?;
    let status = migration::on_report(ctx, report).await?;
    Ok(status.to_string())
}
