//! In-process bus implementation.
//!
//! [`MemoryBus`] fans published messages out to local subscribers through
//! bounded channels. It honors the same contract as the networked bus:
//! publishes fail [`BusError::TransportUnavailable`] before `connect` /
//! after `disconnect`, and slow subscribers lose messages instead of
//! blocking the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::TopicRegistry;
use crate::{Bus, BusError, Subscription};

/// In-process topic fan-out bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    registry: TopicRegistry,
    connected: AtomicBool,
}

impl MemoryBus {
    /// Create a disconnected bus. Call [`Bus::connect`] before publishing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that is already connected.
    pub fn connected() -> Self {
        let bus = Self::new();
        bus.inner.connected.store(true, Ordering::Release);
        bus
    }

    /// Number of live subscribers across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.subscriber_count()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(BusError::TransportUnavailable(
                "memory bus is disconnected".into(),
            ));
        }
        self.inner.registry.deliver(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(BusError::TransportUnavailable(
                "memory bus is disconnected".into(),
            ));
        }
        Ok(self.inner.registry.add(topic))
    }

    async fn unsubscribe(&self, sub: Subscription) {
        self.inner.registry.remove(&sub.topic, sub.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::connected();
        let mut sub = bus.subscribe("agent.create").await.unwrap();

        bus.publish("agent.create", b"{}".to_vec()).unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "agent.create");
        assert_eq!(msg.payload, b"{}");
    }

    #[tokio::test]
    async fn publish_is_topic_scoped() {
        let bus = MemoryBus::connected();
        let mut create = bus.subscribe("agent.create").await.unwrap();
        let mut delete = bus.subscribe("agent.delete").await.unwrap();

        bus.publish("agent.delete", b"x".to_vec()).unwrap();
        assert!(delete.recv().await.is_some());
        assert!(create.try_recv().is_none());
    }

    #[tokio::test]
    async fn disconnected_publish_fails() {
        let bus = MemoryBus::new();
        let err = bus.publish("t", vec![]).unwrap_err();
        assert!(matches!(err, BusError::TransportUnavailable(_)));

        bus.connect().await.unwrap();
        assert!(bus.publish("t", vec![]).is_ok());

        bus.disconnect().await;
        assert!(bus.publish("t", vec![]).is_err());
    }

    #[tokio::test]
    async fn unsubscribe_detaches() {
        let bus = MemoryBus::connected();
        let sub = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(sub).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_not_blocks() {
        let bus = MemoryBus::connected();
        let mut sub = bus.subscribe("t").await.unwrap();

        // Overfill the bounded delivery queue; publish must keep succeeding.
        for i in 0..(crate::SUBSCRIBER_QUEUE_CAP + 10) {
            bus.publish("t", vec![i as u8]).unwrap();
        }

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, crate::SUBSCRIBER_QUEUE_CAP);
    }
}
