use fleet_core::ResourceEvent;
use fleet_exec::{RemoteExec, ScriptCommand, Target};
use fleet_store::StoreTx;
use tracing::debug;

use crate::config::ControlSettings;
use crate::error::HandlerResult;

/// Everything a handler works with for one callback.
///
/// The transaction is owned here and threaded through every nested call;
/// only the dispatcher commits or rolls it back.
pub struct HandlerCtx<'a> {
    pub tx: Box<dyn StoreTx>,
    exec: &'a dyn RemoteExec,
    settings: &'a ControlSettings,
    upstream: Option<&'a str>,
    events: Vec<ResourceEvent>,
}

impl<'a> HandlerCtx<'a> {
    pub fn new(
        tx: Box<dyn StoreTx>,
        exec: &'a dyn RemoteExec,
        settings: &'a ControlSettings,
        upstream: Option<&'a str>,
    ) -> Self {
        Self {
            tx,
            exec,
            settings,
            upstream,
            events: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        self.settings
    }

    /// Error the agent reported alongside the callback, if any.
    pub fn upstream_error(&self) -> Option<&'a str> {
        self.upstream
    }

    /// A command for a script under the configured scripts directory.
    pub fn script(&self, name: &str) -> ScriptCommand {
        ScriptCommand::new(&self.settings.scripts_dir, name)
    }

    /// Hand a command to the execution gateway. Returns once it is handed
    /// off; the outcome arrives later as another callback.
    pub async fn dispatch(
        &mut self,
        target: &Target,
        command: &ScriptCommand,
    ) -> HandlerResult<()> {
        debug!(target = %target, script = command.script(), "Dispatching remote command");
        self.exec.execute(target, &command.to_string()).await?;
        Ok(())
    }

    /// Record a state change, published only if the transaction commits.
    pub fn emit(&mut self, event: ResourceEvent) {
        self.events.push(event);
    }

    pub fn into_parts(self) -> (Box<dyn StoreTx>, Vec<ResourceEvent>) {
        (self.tx, self.events)
    }
}
