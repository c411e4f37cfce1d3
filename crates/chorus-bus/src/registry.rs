//! Shared subscriber bookkeeping for bus implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::{BusMessage, Subscription, SUBSCRIBER_QUEUE_CAP};

/// One registered subscriber on a topic.
struct Entry {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

/// Topic → subscribers map with monotonically increasing subscriber ids.
///
/// Delivery is best-effort per subscriber: a full delivery queue drops the
/// message for that subscriber only, which matches the bus's at-least-once,
/// no-cross-topic-ordering contract.
#[derive(Default)]
pub(crate) struct TopicRegistry {
    topics: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl TopicRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its handle.
    pub(crate) fn add(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut topics) = self.topics.lock() {
            topics
                .entry(topic.to_string())
                .or_default()
                .push(Entry { id, tx });
        }
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Remove a subscriber. Returns true when the topic has no subscribers
    /// left afterwards.
    pub(crate) fn remove(&self, topic: &str, id: u64) -> bool {
        let Ok(mut topics) = self.topics.lock() else {
            return false;
        };
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    /// Deliver a message to every subscriber of `topic`.
    ///
    /// Closed receivers are pruned; full queues count a drop.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) {
        let Ok(mut topics) = self.topics.lock() else {
            return;
        };
        let Some(entries) = topics.get_mut(topic) else {
            return;
        };
        entries.retain(|entry| {
            match entry.tx.try_send(BusMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic,
                        subscriber = entry.id,
                        "slow bus subscriber, message dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if entries.is_empty() {
            topics.remove(topic);
        }
    }

    /// Total messages dropped on full subscriber queues.
    #[allow(dead_code)]
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscribers across all topics.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}
