//! Remote Execution Gateway seam.
//!
//! A dispatch hands a shell-style command to one host or a group of hosts
//! and reports only whether the hand-off worked. The remote outcome comes
//! back later as an independent callback.

pub mod command;
pub mod error;
pub mod gateway;
pub mod recording;
pub mod target;

pub use command::ScriptCommand;
pub use error::ExecError;
pub use gateway::{ProcessGateway, RemoteExec};
pub use recording::{Dispatch, RecordingGateway};
pub use target::Target;
