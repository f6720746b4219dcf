//! Best-effort pub/sub fabric for lifecycle events

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::EvalResult;
use crate::events::LifecycleEvent;

/// Buffer depth before slow subscribers start observing `Lagged`
const BUS_CAPACITY: usize = 4096;

/// Pub/sub bus between the gateway/dispatcher/monitor and the writer
///
/// Delivery is best effort: a subscriber that falls behind loses the
/// oldest events and observes a lag error; the state machine at the
/// writer tolerates the loss.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one lifecycle event
    async fn publish(&self, event: &LifecycleEvent) -> EvalResult<()>;

    /// Open a new subscription receiving all events published after
    /// this call
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

/// In-process bus backed by a tokio broadcast channel
pub struct MemoryEventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl MemoryEventBus {
    /// Create a bus with the default buffer depth
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &LifecycleEvent) -> EvalResult<()> {
        // A send with no live subscribers is not an error on a
        // best-effort bus.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvalId;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = MemoryEventBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        let ev = LifecycleEvent::cancelled(EvalId::generate(), 2);
        bus.publish(&ev).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().sequence, 2);
        assert_eq!(rx_b.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryEventBus::new();
        let ev = LifecycleEvent::cancelled(EvalId::generate(), 0);
        bus.publish(&ev).await.unwrap();
    }
}
