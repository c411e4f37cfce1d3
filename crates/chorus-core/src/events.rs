//! In-process event fan-out.
//!
//! Observers subscribe through the [`EventHub`]; every subscriber gets a
//! bounded channel, and a subscriber that falls behind loses the oldest
//! events rather than stalling the core. Events are emitted strictly
//! after the state change they describe has been committed.

use tokio::sync::broadcast;
use tracing::debug;

use chorus_types::CoreEvent;

/// Per-subscriber buffer depth before drop-oldest kicks in.
const HUB_CAPACITY: usize = 256;

/// Fan-out hub for [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventHub {
    /// Create a hub with the default buffer depth.
    pub fn new() -> Self {
        Self::with_capacity(HUB_CAPACITY)
    }

    /// Create a hub with an explicit per-subscriber buffer depth.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Emit an event to all observers. Never blocks; having no observers
    /// is fine.
    pub fn emit(&self, event: CoreEvent) {
        debug!(topic = event.topic(), "core event");
        let _ = self.tx.send(event);
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of the event stream.
pub struct EventStream {
    rx: broadcast::Receiver<CoreEvent>,
}

impl EventStream {
    /// Next event. A lagged subscriber silently skips the overwritten
    /// events and resumes with the oldest retained one. Returns `None`
    /// once the hub is gone.
    pub async fn next(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "slow event observer skipped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for polling contexts.
    pub fn try_next(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_types::AgentId;
    use chrono::Utc;

    fn created(id: &str) -> CoreEvent {
        CoreEvent::AgentCreated {
            agent: AgentId::new(id),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_reach_all_observers() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(created("a1"));

        assert_eq!(a.next().await.unwrap().topic(), "agent.created");
        assert_eq!(b.next().await.unwrap().topic(), "agent.created");
    }

    #[tokio::test]
    async fn emit_without_observers_is_fine() {
        let hub = EventHub::new();
        hub.emit(created("a1"));
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn slow_observer_drops_oldest_not_newest() {
        let hub = EventHub::with_capacity(4);
        let mut stream = hub.subscribe();

        for i in 0..10 {
            hub.emit(created(&format!("a{i}")));
        }

        // The earliest events were overwritten; the stream resumes with
        // the retained tail and ends with the newest.
        let mut seen = Vec::new();
        while let Some(event) = stream.try_next() {
            if let CoreEvent::AgentCreated { agent, .. } = event {
                seen.push(agent.to_string());
            }
        }
        assert!(!seen.is_empty());
        assert!(seen.len() <= 4);
        assert_eq!(seen.last().map(String::as_str), Some("a9"));
    }
}
