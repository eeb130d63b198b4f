//! Address allocation from a subnet's pool.
//!
//! Callbacks only ever release addresses. [`allocate`] is the entry point for
//! the administrative layer that creates interfaces and second addresses;
//! it runs inside the same [`StoreTx`] the caller creates the interface in.

use fleet_core::{Address, AddressKind, Subnet};
use fleet_store::StoreTx;
use tracing::debug;

use crate::error::{HandlerError, HandlerResult};

/// Take a free address of `subnet` for an interface.
///
/// The row is reserved for the transaction when picked, so two allocations
/// racing for the same subnet never get the same address. `wanted` may be given
/// with or without its prefix length.
pub async fn allocate(
    tx: &mut dyn StoreTx,
    subnet: &Subnet,
    interface_id: i64,
    wanted: Option<&str>,
    kind: AddressKind,
) -> HandlerResult<Address> {
    let mut address = tx
        .lock_free_address(subnet.id, wanted)
        .await?
        .ok_or_else(|| match wanted {
            Some(ip) => HandlerError::not_found("free address", format!("{ip} in subnet {}", subnet.id)),
            None => HandlerError::not_found("free address in subnet", subnet.id),
        })?;
    match kind {
        AddressKind::Native => address.interface = interface_id,
        AddressKind::Second => address.second_interface = interface_id,
    }
    address.kind = kind;
    address.allocated = true;
    tx.update_address(address.clone()).await?;
    debug!(
        subnet = subnet.id,
        interface = interface_id,
        address = %address.address,
        "Allocated address"
    );
    Ok(address)
}

/// Release every address the interface holds, as main or second owner.
///
/// A row shared with another interface keeps that other reference and stays
/// allocated. Returns the number of rows touched.
pub async fn release_interface(tx: &mut dyn StoreTx, interface_id: i64) -> HandlerResult<usize> {
    let addresses = tx.addresses_of_interface(interface_id).await?;
    let touched = addresses.len();
    for mut address in addresses {
        if address.interface == interface_id {
            address.interface = 0;
        }
        if address.second_interface == interface_id {
            address.second_interface = 0;
        }
        address.allocated = address.interface > 0 || address.second_interface > 0;
        tx.update_address(address).await?;
    }
    Ok(touched)
}
