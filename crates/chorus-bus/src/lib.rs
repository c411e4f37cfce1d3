//! Topic-addressed publish/subscribe service used for cross-process control
//! and event fan-out.
//!
//! The bus is a collaborator interface, not the intra-process communication
//! medium: the core uses it to receive control commands (create/delete
//! agent, join/leave room, speak) and to broadcast observer events. Payloads
//! are opaque bytes; the typed JSON envelopes live in [`envelope`].
//!
//! Delivery is at-least-once with no ordering guarantee across topics.
//! `publish` never blocks the caller: each implementation buffers into a
//! small bounded queue and fails with [`BusError::Backpressure`] once it is
//! full.
//!
//! Two implementations:
//!
//! - [`MemoryBus`]: in-process fan-out over bounded channels. Used by tests
//!   and single-process deployments.
//! - [`WsBus`]: JSON frames over a WebSocket connection to an external
//!   broker, with heartbeat pings and an availability flag.

pub mod envelope;
pub mod memory;
mod registry;
pub mod ws;

pub use memory::MemoryBus;
pub use ws::{WsBus, WsBusConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Default capacity of the per-subscriber delivery queue.
pub const SUBSCRIBER_QUEUE_CAP: usize = 64;

/// Default capacity of the outbound publish queue.
pub const PUBLISH_QUEUE_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The underlying transport is disconnected.
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The bounded publish queue is full.
    #[error("bus publish queue full ({0} pending)")]
    Backpressure(usize),

    /// A payload could not be decoded into its typed envelope.
    #[error("bus payload decode failed: {0}")]
    Decode(String),
}

impl From<BusError> for chorus_types::CoreError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::TransportUnavailable(msg) => {
                chorus_types::CoreError::TransportUnavailable(msg)
            }
            BusError::Backpressure(pending) => {
                chorus_types::CoreError::Busy(format!("bus publish queue full ({pending} pending)"))
            }
            BusError::Decode(msg) => chorus_types::CoreError::InvalidArgument(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus trait
// ---------------------------------------------------------------------------

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The topic the message was published on.
    pub topic: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// A live subscription to one topic.
///
/// Messages are drained from [`Subscription::recv`]. Dropping the
/// subscription (or calling `unsubscribe`) detaches it from the bus.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) topic: String,
    pub(crate) rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive for polling contexts.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// The pub/sub collaborator interface.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Establish the underlying connection. Idempotent.
    async fn connect(&self) -> Result<(), BusError>;

    /// Tear down the connection. Pending queued publishes are dropped.
    async fn disconnect(&self);

    /// Queue a payload for publication on `topic`.
    ///
    /// Non-blocking: buffers into a bounded queue and returns
    /// [`BusError::Backpressure`] when it is full, or
    /// [`BusError::TransportUnavailable`] when disconnected.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to a topic. The returned handle receives every message
    /// published on it from this point on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    /// Remove a subscription. Equivalent to dropping the handle, but also
    /// informs a remote broker where one exists.
    async fn unsubscribe(&self, sub: Subscription);
}
