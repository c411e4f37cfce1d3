//! WebSocket media transport.
//!
//! Speaks the media server's request/response conventions as JSON frames
//! over one WebSocket: every call carries a correlation id, the reader
//! task resolves pending calls as responses arrive, and audio crossing
//! the socket is base64-encoded for text-frame safety.
//!
//! Chunk pushes ([`MediaTransport::send_audio`]) are fire-and-forget
//! notifications so a speaking turn never stalls on per-chunk acks. An
//! unanswered call past the media timeout is treated as a transport drop,
//! which is what lets the owning [`crate::RoomClient`] start its
//! reconnect supervision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use chorus_types::{AudioFormat, CoreError, CoreResult, RoomId};

use crate::transport::{MediaCapture, MediaTransport, Participant};

/// Outbound frame queue depth.
const OUT_QUEUE_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    /// Correlation id; 0 marks a one-way notification.
    id: u64,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Configuration for the WebSocket media transport.
#[derive(Debug, Clone)]
pub struct WsMediaTransportConfig {
    /// Media server URL, e.g. `ws://127.0.0.1:4443/rtc`.
    pub url: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl WsMediaTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_millis(10_000),
        }
    }
}

struct Inner {
    config: WsMediaTransportConfig,
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CoreResult<Value>>>>,
    out_tx: Mutex<Option<mpsc::Sender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One WebSocket connection to the media server.
#[derive(Clone)]
pub struct WsMediaTransport {
    inner: Arc<Inner>,
}

impl WsMediaTransport {
    /// Create a disconnected transport. Call [`WsMediaTransport::connect`]
    /// before handing it to a room client.
    pub fn new(config: WsMediaTransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                out_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Dial the media server and start the reader/writer tasks.
    pub async fn connect(&self) -> CoreResult<()> {
        if self.inner.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let (stream, _) = connect_async(&self.inner.config.url)
            .await
            .map_err(|e| CoreError::TransportUnavailable(format!("media dial failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUT_QUEUE_CAP);
        if let Ok(mut guard) = self.inner.out_tx.lock() {
            *guard = Some(out_tx);
        }
        self.inner.connected.store(true, Ordering::Release);
        info!(url = %self.inner.config.url, "media transport connected");

        let writer_inner = Arc::clone(&self.inner);
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "media socket write failed");
                    break;
                }
            }
            writer_inner.mark_disconnected();
        });

        let reader_inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let response: RpcResponse = match serde_json::from_str(&text) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(error = %e, "ignoring malformed media frame");
                        continue;
                    }
                };
                reader_inner.resolve(response);
            }
            reader_inner.mark_disconnected();
            info!("media transport closed");
        });

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }
        Ok(())
    }

    /// Close the connection and fail all pending calls.
    pub async fn disconnect(&self) {
        self.inner.mark_disconnected();
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Issue one request and await its response.
    async fn call(&self, method: &str, params: Value) -> CoreResult<Value> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(CoreError::TransportUnavailable(
                "media transport is not connected".into(),
            ));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.insert(id, tx);
        }

        let frame = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send_frame(&frame) {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::TransportUnavailable(
                "media connection lost mid-call".into(),
            )),
            Err(_) => {
                if let Ok(mut pending) = self.inner.pending.lock() {
                    pending.remove(&id);
                }
                // An unresponsive media server is handled like a dropped
                // link so the room client starts reconnecting.
                Err(CoreError::TransportUnavailable(format!(
                    "media call {method} timed out after {} ms",
                    self.inner.config.timeout.as_millis()
                )))
            }
        }
    }

    /// Send a one-way notification (correlation id 0).
    fn notify(&self, method: &str, params: Value) -> CoreResult<()> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(CoreError::TransportUnavailable(
                "media transport is not connected".into(),
            ));
        }
        self.send_frame(&RpcRequest {
            id: 0,
            method: method.to_string(),
            params,
        })
    }

    fn send_frame(&self, frame: &RpcRequest) -> CoreResult<()> {
        let text = serde_json::to_string(frame)
            .map_err(|e| CoreError::InvalidArgument(format!("unserializable frame: {e}")))?;
        let tx = self
            .inner
            .out_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| {
                CoreError::TransportUnavailable("media transport is not connected".into())
            })?;
        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CoreError::Busy("media outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CoreError::TransportUnavailable("media writer is gone".into())
            }
        })
    }
}

impl Inner {
    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut guard) = self.out_tx.lock() {
            *guard = None;
        }
        if let Ok(mut pending) = self.pending.lock() {
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(CoreError::TransportUnavailable(
                    "media connection closed".into(),
                )));
            }
        }
    }

    fn resolve(&self, response: RpcResponse) {
        let Some(tx) = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&response.id))
        else {
            return;
        };
        let outcome = match (response.result, response.error) {
            (_, Some(err)) => Err(CoreError::ProviderError(format!(
                "media server error {}: {}",
                err.code, err.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        let _ = tx.send(outcome);
    }
}

fn field_str(value: &Value, key: &str) -> CoreResult<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::ProviderError(format!("media response missing '{key}'")))
}

#[async_trait]
impl MediaTransport for WsMediaTransport {
    async fn join(&self, room: &RoomId, peer_id: &str) -> CoreResult<()> {
        self.call(
            "room.join",
            json!({ "room": room, "peer": peer_id }),
        )
        .await
        .map(|_| ())
    }

    async fn leave(&self) -> CoreResult<()> {
        self.call("room.leave", json!({})).await.map(|_| ())
    }

    async fn produce(&self, format: AudioFormat) -> CoreResult<String> {
        let result = self
            .call("producer.create", json!({ "format": format }))
            .await?;
        field_str(&result, "producer_id")
    }

    async fn send_audio(&self, producer_id: &str, chunk: &[u8]) -> CoreResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
        self.notify(
            "producer.send",
            json!({ "producer_id": producer_id, "audio": encoded }),
        )
    }

    async fn stop_produce(&self, producer_id: &str) -> CoreResult<()> {
        self.call("producer.close", json!({ "producer_id": producer_id }))
            .await
            .map(|_| ())
    }

    async fn consume(
        &self,
        source: &str,
        duration_ms: u64,
        format: AudioFormat,
    ) -> CoreResult<MediaCapture> {
        let result = self
            .call(
                "consumer.capture",
                json!({ "source": source, "duration_ms": duration_ms, "format": format }),
            )
            .await?;
        let consumer_id = field_str(&result, "consumer_id")?;
        let audio_b64 = field_str(&result, "audio")?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(audio_b64)
            .map_err(|e| CoreError::ProviderError(format!("bad base64 audio: {e}")))?;
        Ok(MediaCapture {
            consumer_id,
            audio,
            format,
        })
    }

    async fn stop_consume(&self, consumer_id: &str) -> CoreResult<()> {
        self.call("consumer.close", json!({ "consumer_id": consumer_id }))
            .await
            .map(|_| ())
    }

    async fn list_participants(&self) -> CoreResult<Vec<Participant>> {
        let result = self.call("room.participants", json!({})).await?;
        let participants = result
            .get("participants")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(participants)
            .map_err(|e| CoreError::ProviderError(format!("bad participant list: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}
