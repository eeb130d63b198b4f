// fleet-control: callback dispatcher, lifecycle handlers and network reconciliation
// Depends on fleet-core for types, fleet-store for state and fleet-exec for remote dispatch.

pub mod address;
pub mod args;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fdb;
pub mod handlers;
pub mod ingress;
pub mod migration;
pub mod netinfo;
pub mod reconciler;
pub mod server;

pub use address::{allocate as allocate_address, release_interface};
pub use command::{Command, Registry};
pub use config::{ControlSettings, FleetConfig, GatewaySettings, IngressSettings};
pub use dispatcher::Dispatcher;
pub use error::{HandlerError, HandlerResult};
pub use events::EventPublisher;
pub use ingress::{Callback, IngressError, LineParser, ReplaySummary};
pub use server::IngressState;
