//! State store seam for the fleet control plane.
//!
//! Handlers talk to a [`StoreTx`] unit of work obtained from a
//! [`StateStore`]; the dispatcher owns commit and rollback. [`MemoryStore`]
//! is the in-process implementation used by `fleetctl replay` and tests.

pub mod error;
#[cfg(any(test, feature = "fixture"))]
pub mod fixture;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use snapshot::FleetSnapshot;
pub use store::{
    Endpoint, InstanceUpdate, MigrationUpdate, Nic, StateStore, StoreTx, VolumeUpdate,
};
