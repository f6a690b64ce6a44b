use crate::models::{Deployment, DeploymentEvent};
use tokio::sync::broadcast;

/// Fan-out publisher for deployment lifecycle events.
///
/// Built on a broadcast channel: emission never blocks the writer path, each
/// subscriber has a bounded buffer, and a lagging subscriber drops its oldest
/// events rather than slowing anyone else down. Constructed once and passed
/// by reference into the components that persist transitions; never ambient
/// global state.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    sender: broadcast::Sender<DeploymentEvent>,
}

impl StatusPublisher {
    /// Create a new publisher with the specified per-subscriber capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish one event for a just-persisted transition.
    ///
    /// Fire-and-forget: zero subscribers is not an error, callers never wait.
    pub fn publish(&self, deployment: &Deployment, message: impl Into<String>) {
        let event = DeploymentEvent::from_deployment(deployment, message);
        // send() errors only when there are no subscribers; events are
        // published regardless of whether anyone is listening.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
