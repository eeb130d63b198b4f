use std::sync::Arc;

use fleet_exec::RemoteExec;
use fleet_store::{StateStore, StoreError, StoreTx};
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::args::Args;
use crate::command::Registry;
use crate::config::ControlSettings;
use crate::context::HandlerCtx;
use crate::error::{HandlerError, HandlerResult};
use crate::events::EventPublisher;
use crate::handlers;

/// Entry point for agent callbacks.
///
/// Every callback runs in its own transaction, and callbacks run side by side
/// without waiting on each other. The handler's error decides the outcome:
/// remote-side failures commit what was written, everything else rolls back.
/// A commit that loses a write conflict to a concurrent callback applies
/// nothing. Resource events go out only after a commit.
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    exec: Arc<dyn RemoteExec>,
    settings: ControlSettings,
    registry: Registry,
    events: EventPublisher,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        exec: Arc<dyn RemoteExec>,
        settings: ControlSettings,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            exec,
            settings,
            registry: Registry::builtin(),
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply one callback. `args[0]` is the command name by convention;
    /// unknown commands are ignored.
    pub async fn dispatch(
        &self,
        command: &str,
        args: &[String],
        upstream: Option<&str>,
    ) -> HandlerResult<String> {
        let span = info_span!("callback", command, request_id = %Uuid::new_v4());
        self.apply(command, args, upstream).instrument(span).await
    }

    async fn apply(
        &self,
        command: &str,
        args: &[String],
        upstream: Option<&str>,
    ) -> HandlerResult<String> {
        let Some(cmd) = self.registry.lookup(command) else {
            debug!("Unknown command, ignoring");
            return Ok(String::new());
        };

        let tx = self.store.begin().await?;
        let mut ctx = HandlerCtx::new(tx, self.exec.as_ref(), &self.settings, upstream);
        let result = handlers::handle(cmd, &mut ctx, Args::new(args)).await;
        let (tx, events) = ctx.into_parts();

        match &result {
            Ok(status) => {
                commit(tx).await?;
                debug!(status = %status, events = events.len(), "Callback applied");
                self.events.publish_all(events);
            }
            Err(e) if !e.rolls_back() => {
                commit(tx).await?;
                warn!(error = %e, kind = e.kind(), "Callback applied, remote side incomplete");
                self.events.publish_all(events);
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "Rollback failed");
                }
                match e {
                    HandlerError::Store(_) => {
                        error!(error = %e, kind = e.kind(), "Callback rolled back")
                    }
                    _ => warn!(error = %e, kind = e.kind(), "Callback rejected"),
                }
            }
        }
        result
    }
}

async fn commit(tx: Box<dyn StoreTx>) -> HandlerResult<()> {
    tx.commit().await.map_err(|e| {
        match &e {
            StoreError::Conflict { .. } => {
                warn!(error = %e, "Callback lost a write conflict, nothing applied")
            }
            _ => error!(error = %e, "Commit failed"),
        }
        HandlerError::Store(e)
    })
}
