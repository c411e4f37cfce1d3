//! WebSocket bus client.
//!
//! [`WsBus`] speaks a small JSON frame protocol to an external broker over
//! a single WebSocket connection. Frames are serde-tagged; audio-bearing
//! payloads are base64-encoded for text-frame safety.
//!
//! A writer task drains the bounded publish queue and emits heartbeat
//! pings; a reader task routes incoming publishes to local subscribers.
//! When the socket drops, the bus flips to unavailable and every publish
//! fails [`BusError::TransportUnavailable`] until `connect` is called
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::registry::TopicRegistry;
use crate::{Bus, BusError, Subscription, PUBLISH_QUEUE_CAP};

/// Interval between heartbeat pings on the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Frame protocol between the bus client and the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// A published message. Payload is base64-encoded bytes.
    Publish { topic: String, payload: String },
    /// Register interest in a topic.
    Subscribe { topic: String },
    /// Drop interest in a topic.
    Unsubscribe { topic: String },
    /// Keepalive request.
    Ping,
    /// Keepalive response.
    Pong,
}

// ---------------------------------------------------------------------------
// WsBus
// ---------------------------------------------------------------------------

/// Configuration for the WebSocket bus client.
#[derive(Debug, Clone)]
pub struct WsBusConfig {
    /// Broker URL, e.g. `ws://127.0.0.1:7350/bus`.
    pub url: String,
    /// Outbound publish queue capacity.
    pub publish_queue_cap: usize,
}

impl WsBusConfig {
    /// Config with the default queue capacity.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publish_queue_cap: PUBLISH_QUEUE_CAP,
        }
    }
}

/// WebSocket-backed bus client.
pub struct WsBus {
    config: WsBusConfig,
    registry: Arc<TopicRegistry>,
    connected: Arc<AtomicBool>,
    out_tx: Mutex<Option<mpsc::Sender<WireFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsBus {
    /// Create a disconnected client. Call [`Bus::connect`] to dial.
    pub fn new(config: WsBusConfig) -> Self {
        Self {
            config,
            registry: Arc::new(TopicRegistry::new()),
            connected: Arc::new(AtomicBool::new(false)),
            out_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<WireFrame>> {
        self.out_tx.lock().ok().and_then(|guard| guard.clone())
    }

    fn queue_frame(&self, frame: WireFrame) -> Result<(), BusError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BusError::TransportUnavailable(format!(
                "not connected to {}",
                self.config.url
            )));
        }
        let Some(tx) = self.sender() else {
            return Err(BusError::TransportUnavailable(format!(
                "not connected to {}",
                self.config.url
            )));
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BusError::Backpressure(self.config.publish_queue_cap)
            }
            mpsc::error::TrySendError::Closed(_) => {
                BusError::TransportUnavailable("bus writer task is gone".into())
            }
        })
    }
}

#[async_trait]
impl Bus for WsBus {
    async fn connect(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let (stream, _) = connect_async(&self.config.url)
            .await
            .map_err(|e| BusError::TransportUnavailable(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(self.config.publish_queue_cap);
        if let Ok(mut guard) = self.out_tx.lock() {
            *guard = Some(out_tx.clone());
        }
        self.connected.store(true, Ordering::Release);
        info!(url = %self.config.url, "bus connected");

        // Writer: drain the publish queue, interleave heartbeats.
        let connected = Arc::clone(&self.connected);
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = heartbeat.tick() => WireFrame::Ping,
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "unserializable bus frame dropped");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "bus socket write failed");
                    break;
                }
            }
            connected.store(false, Ordering::Release);
        });

        // Reader: route incoming publishes to local subscribers.
        let registry = Arc::clone(&self.registry);
        let connected = Arc::clone(&self.connected);
        let pong_tx = out_tx;
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame: WireFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "ignoring malformed bus frame");
                        continue;
                    }
                };
                match frame {
                    WireFrame::Publish { topic, payload } => {
                        match base64::engine::general_purpose::STANDARD.decode(&payload) {
                            Ok(bytes) => registry.deliver(&topic, &bytes),
                            Err(e) => debug!(error = %e, topic, "bad base64 payload dropped"),
                        }
                    }
                    WireFrame::Ping => {
                        let _ = pong_tx.try_send(WireFrame::Pong);
                    }
                    WireFrame::Pong | WireFrame::Subscribe { .. } | WireFrame::Unsubscribe { .. } => {}
                }
            }
            connected.store(false, Ordering::Release);
            info!("bus connection closed");
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut guard) = self.out_tx.lock() {
            *guard = None;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        self.queue_frame(WireFrame::Publish {
            topic: topic.to_string(),
            payload: encoded,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        self.queue_frame(WireFrame::Subscribe {
            topic: topic.to_string(),
        })?;
        Ok(self.registry.add(topic))
    }

    async fn unsubscribe(&self, sub: Subscription) {
        let last = self.registry.remove(&sub.topic, sub.id);
        if last {
            let _ = self.queue_frame(WireFrame::Unsubscribe { topic: sub.topic });
        }
    }
}
