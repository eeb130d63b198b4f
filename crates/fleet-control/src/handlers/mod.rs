//! One handler per callback command.
//!
//! Each handler parses its own positional arguments into a typed report and
//! works inside the transaction carried by the context.

pub mod cg;
pub mod hyper;
pub mod image;
pub mod instance;
pub mod migrate;
pub mod nic;
pub mod volume;
pub mod vrrp;

use crate::args::Args;
use crate::command::Command;
use crate::context::HandlerCtx;
use crate::error::HandlerResult;
use crate::reconciler::VrrpFlavor;

/// Run the handler of `command`. Returns a short status for the log.
pub async fn handle(
    command: Command,
    ctx: &mut HandlerCtx<'_>,
    args: Args<'_>,
) -> HandlerResult<String> {
    match command {
        Command::LaunchVm => instance::launch_vm(ctx, args).await,
        Command::ActionVm => instance::action_vm(ctx, args).await,
        Command::ClearVm => instance::clear_vm(ctx, args).await,
        Command::MigrateVm => migrate::migrate_vm(ctx, args).await,
        Command::AttachVmNic => nic::attach_vm_nic(ctx, args).await,
        Command::DetachVmNic => nic::detach_vm_nic(ctx, args).await,
        Command::ClearSecondIps => nic::clear_second_ips(ctx, args).await,
        Command::AttachVolume => volume::attach_volume(ctx, args).await,
        Command::CreateVolume => volume::create_volume(ctx, args).await,
        Command::ResizeVolume => volume::resize_volume(ctx, args).await,
        Command::HyperStatus => hyper::hyper_status(ctx, args).await,
        Command::SetVrrpIp => vrrp::role_report(ctx, args, VrrpFlavor::VrrpIp).await,
        Command::CreateKeepalivedConf => {
            vrrp::role_report(ctx, args, VrrpFlavor::KeepalivedConf).await
        }
        Command::CaptureImage => image::capture_image(ctx, args).await,
        Command::CreateImage => image::create_image(ctx, args).await,
        Command::SyncImageInfo => image::sync_image_info(ctx, args).await,
        Command::VolumeSnapshot => volume::volume_snapshot(ctx, args).await,
        Command::CreateCg => cg::create_cg(ctx, args).await,
        Command::DeleteCg => cg::delete_cg(ctx, args).await,
        Command::AddVolumesToCg | Command::RemoveVolumesFromCg => {
            cg::membership_changed(ctx, args).await
        }
        Command::CreateCgSnapshot => cg::create_cg_snapshot(ctx, args).await,
        Command::DeleteCgSnapshot => cg::delete_cg_snapshot(ctx, args).await,
        Command::RestoreCgSnapshot => cg::restore_cg_snapshot(ctx, args).await,
    }
}
