// =============================================================================
// Event emitter (§6.5) — best-effort in-process broadcast of engine lifecycle
// and per-cycle events.
// =============================================================================
//
// No delivery guarantees beyond best-effort dispatch: a subscriber that lags
// behind the channel capacity misses the oldest buffered events, which is
// acceptable here since every event is also folded into the Engine's own
// cycle history and status snapshot.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast channel; chosen generously relative to the
/// handful of events one cycle can emit.
const CHANNEL_CAPACITY: usize = 256;

/// A minimal per-cycle summary carried on `CycleComplete`. The Engine's own
/// `CycleRecord` (§3) is richer; this is only what an external subscriber
/// needs to know a cycle finished and how it went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub action: String,
    pub symbol: Option<String>,
    pub error_count: u32,
}

/// The five named lifecycle events from §6.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    Started,
    Stopped,
    CycleStart { n: u64 },
    CycleComplete { cycle: CycleSummary },
    SnapshotFailure { count: u32 },
}

/// Thin wrapper around a `tokio::sync::broadcast::Sender`. Cloning an
/// `EventBus` shares the same underlying channel; every clone can publish
/// and every subscriber sees every publisher's events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to future events. Events published before this call are
    /// never delivered to this receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. A `SendError` (no subscribers) is not a failure
    /// condition — the bus has best-effort delivery only.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event.clone()).is_err() {
            trace!(?event, "published event with no active subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::Started);
        bus.publish(EngineEvent::CycleStart { n: 1 });

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Started));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::CycleStart { n: 1 }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::Stopped);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_all_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineEvent::SnapshotFailure { count: 3 });

        assert!(matches!(rx1.recv().await.unwrap(), EngineEvent::SnapshotFailure { count: 3 }));
        assert!(matches!(rx2.recv().await.unwrap(), EngineEvent::SnapshotFailure { count: 3 }));
    }
}
