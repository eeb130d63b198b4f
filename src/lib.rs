//! # fleetctl: fleet state and overlay network reconciliation
//!
//! Facade crate that re-exports the fleet workspace crates so consumers
//! can depend on a single `fleetctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | fleet-core | Entity rows, lifecycle rules, wire payloads |
//! | [`store`] | fleet-store | Transactional state store seam, in-memory store |
//! | [`exec`] | fleet-exec | Remote execution gateway seam, dispatch targets |
//! | [`control`] | fleet-control | Callback dispatcher, handlers, FDB and migration engines |

pub mod cli;
pub mod logging;

pub use fleet_control as control;
pub use fleet_core as core;
pub use fleet_exec as exec;
pub use fleet_store as store;
