use fleet_core::ResourceEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Publishes committed resource changes to a bounded queue.
///
/// Publishing never blocks a callback: a full queue drops the event.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    sender: Option<mpsc::Sender<ResourceEvent>>,
}

impl EventPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ResourceEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A publisher that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ResourceEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    resource = %event.resource_type,
                    id = event.resource_id,
                    status = %event.status,
                    "Event queue full, dropping resource event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!(
                    resource = %event.resource_type,
                    id = event.resource_id,
                    "Event consumer gone, dropping resource event"
                );
            }
        }
    }

    pub fn publish_all(&self, events: Vec<ResourceEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
