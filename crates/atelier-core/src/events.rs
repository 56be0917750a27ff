//! Progress events
//!
//! Every status change the orchestrator makes is published in order on a
//! broadcast channel. Slow subscribers may lag and miss events; the batch
//! itself is always the source of truth.

use crate::types::{BatchEpoch, ItemId, ItemStatus};
use tokio::sync::broadcast;

/// Default channel capacity
pub const EVENT_CAPACITY: usize = 256;

/// Something observable happened to the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// An item joined the batch
    ItemEnqueued { id: ItemId },
    /// An item changed state
    StatusChanged {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },
    /// An item left the batch
    ItemRemoved { id: ItemId },
    /// Stored output could not be billed
    BillingIssue { id: ItemId, message: String },
    /// The pass stopped early for a batch-level reason
    BatchHalted { reason: String },
    /// The batch was reset
    BatchCleared { epoch: BatchEpoch },
}

/// Sender half shared by the orchestrator
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    /// Create a bus with `capacity` buffered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is fine
    pub fn publish(&self, event: BatchEvent) {
        let _ = self.sender.send(event);
    }

    /// New subscriber receiving events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        bus.publish(BatchEvent::BatchHalted {
            reason: "unseen".into(),
        });

        let mut rx = bus.subscribe();
        let id = ItemId::new();
        bus.publish(BatchEvent::ItemEnqueued { id });
        bus.publish(BatchEvent::StatusChanged {
            id,
            from: ItemStatus::Queued,
            to: ItemStatus::Analyzing,
        });

        assert_eq!(rx.recv().await.unwrap(), BatchEvent::ItemEnqueued { id });
        assert!(matches!(
            rx.recv().await.unwrap(),
            BatchEvent::StatusChanged {
                to: ItemStatus::Analyzing,
                ..
            }
        ));
    }
}
