use tokio::sync::broadcast;

use super::audit::{AuditEntry, AuditSink};
use crate::constants::defaults;

/// Broadcast publisher for audit entries
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<AuditEntry>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an entry to every current subscriber.
    ///
    /// Publishing with no subscribers is not an error; slow subscribers lag
    /// rather than block the publisher.
    pub fn publish(&self, entry: AuditEntry) -> Result<(), PublishError> {
        match self.sender.send(entry) {
            Ok(_) | Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(defaults::EVENT_CHANNEL_CAPACITY)
    }
}

impl AuditSink for EventPublisher {
    fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.publish(entry) {
            tracing::warn!(error = %err, "Failed to publish audit entry");
        }
    }
}
