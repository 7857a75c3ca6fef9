// bus.rs - internal sync/conflict event bus
//
// Modeled as a typed broadcast channel (DESIGN NOTES): UI and logging
// observers subscribe independently; a slow or absent observer never
// blocks the Sync Coordinator.

use crate::model::TaskId;
use crate::resolver::ConflictStrategy;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Synced { project: String, id: TaskId },
    ConflictResolved { project: String, id: TaskId, strategy: ConflictStrategy },
    ReconcileFailed { project: String, error: String },
}

const DEFAULT_CAPACITY: usize = 256;

pub struct Bus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// No-op if there are no subscribers; a missing observer is never a
    /// reason to fail a sync pass.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let id = TaskId::new();
        bus.publish(SyncEvent::Synced { project: "p".into(), id });
        match rx.recv().await.unwrap() {
            SyncEvent::Synced { project, id: got } => {
                assert_eq!(project, "p");
                assert_eq!(got, id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = Bus::new(8);
        bus.publish(SyncEvent::ReconcileFailed { project: "p".into(), error: "x".into() });
    }
}
