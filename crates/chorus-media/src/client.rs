//! Per-binding room client with lifecycle state machine and supervised
//! reconnection.
//!
//! A [`RoomClient`] owns one joined room for one agent. It hands out
//! *stable local producer ids* (UUIDs) and maps them to server-side ids,
//! so a reconnect can re-advertise producers without invalidating the
//! handles held by the egress task.
//!
//! State transitions are fail-closed:
//!
//! ```text
//! idle ── join ──▶ active ── transport drop ──▶ disconnected-transient
//!   │                │                               │           │
//!   │                └── leave ──▶ closed ◀── budget exhausted ──┘
//!   └────────────── close ─────────▶                 │
//!                                    active ◀── rejoin succeeded
//! ```
//!
//! Reconnection is a supervised task with a bounded budget and linear
//! backoff; exhaustion moves the client to `closed` and fires the
//! teardown signal the owning binding listens on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use chorus_types::{AudioFormat, CoreError, CoreResult, RoomId};

use crate::transport::{MediaCapture, MediaTransport, Participant};

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Lifecycle state of a room client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, not yet joined.
    Idle,
    /// Joined and serving media.
    Active,
    /// Transport dropped; a reconnect task is running.
    DisconnectedTransient,
    /// Left, or reconnect budget exhausted. Terminal.
    Closed,
}

impl ClientState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        self == ClientState::Closed
    }

    /// Check whether transitioning from `self` to `target` is valid.
    pub fn can_transition_to(self, target: ClientState) -> bool {
        matches!(
            (self, target),
            (ClientState::Idle, ClientState::Active)
                | (ClientState::Idle, ClientState::Closed)
                | (ClientState::Active, ClientState::DisconnectedTransient)
                | (ClientState::Active, ClientState::Closed)
                | (ClientState::DisconnectedTransient, ClientState::Active)
                | (ClientState::DisconnectedTransient, ClientState::Closed)
        )
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Reconnection policy for a room client.
#[derive(Debug, Clone)]
pub struct RoomClientConfig {
    /// Reconnect attempts before the binding is torn down.
    pub reconnect_attempts: u32,
    /// Base backoff; attempt N waits N × this.
    pub backoff: Duration,
    /// Default capture duration for consumers.
    pub consume_duration_ms: u64,
}

impl Default for RoomClientConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            backoff: Duration::from_millis(1_000),
            consume_duration_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// RoomClient
// ---------------------------------------------------------------------------

struct Inner {
    transport: Arc<dyn MediaTransport>,
    config: RoomClientConfig,
    room: RoomId,
    peer_id: String,
    state: Mutex<ClientState>,
    /// Local producer id → server producer id.
    producers: Mutex<HashMap<String, String>>,
    consumers: Mutex<HashSet<String>>,
    teardown_tx: watch::Sender<bool>,
}

/// Cloneable handle to one agent's room membership.
#[derive(Clone)]
pub struct RoomClient {
    inner: Arc<Inner>,
    teardown_rx: watch::Receiver<bool>,
}

impl RoomClient {
    /// Create a client for one room membership. Does not join yet.
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        room: RoomId,
        peer_id: impl Into<String>,
        config: RoomClientConfig,
    ) -> Self {
        let (teardown_tx, teardown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                room,
                peer_id: peer_id.into(),
                state: Mutex::new(ClientState::Idle),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashSet::new()),
                teardown_tx,
            }),
            teardown_rx,
        }
    }

    /// The room this client belongs to.
    pub fn room(&self) -> &RoomId {
        &self.inner.room
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ClientState::Closed)
    }

    /// A watch that flips to `true` when the reconnect budget is exhausted
    /// and the owning binding must tear down.
    pub fn teardown_signal(&self) -> watch::Receiver<bool> {
        self.teardown_rx.clone()
    }

    fn transition(&self, target: ClientState) -> CoreResult<()> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Err(CoreError::MediaUnrecoverable("client state poisoned".into()));
        };
        if !state.can_transition_to(target) {
            return Err(CoreError::InvalidArgument(format!(
                "invalid media client transition: {:?} -> {target:?}",
                *state
            )));
        }
        *state = target;
        Ok(())
    }

    fn ensure_active(&self) -> CoreResult<()> {
        match self.state() {
            ClientState::Active => Ok(()),
            ClientState::Closed => Err(CoreError::MediaUnrecoverable(format!(
                "media client for room {} is closed",
                self.inner.room
            ))),
            other => Err(CoreError::TransportUnavailable(format!(
                "media client for room {} is {other:?}",
                self.inner.room
            ))),
        }
    }

    /// Join the room. `idle → active`.
    pub async fn join(&self) -> CoreResult<()> {
        if self.state() != ClientState::Idle {
            return Err(CoreError::InvalidArgument(
                "media client has already joined".into(),
            ));
        }
        self.inner
            .transport
            .join(&self.inner.room, &self.inner.peer_id)
            .await?;
        self.transition(ClientState::Active)?;
        info!(room = %self.inner.room, peer = %self.inner.peer_id, "joined media room");
        Ok(())
    }

    /// Leave the room, closing any still-open producers and consumers.
    /// Any state → `closed`.
    pub async fn leave(&self) {
        let producer_ids: Vec<String> = self
            .inner
            .producers
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        for id in producer_ids {
            let _ = self.inner.transport.stop_produce(&id).await;
        }
        if let Ok(mut producers) = self.inner.producers.lock() {
            producers.clear();
        }

        let consumer_ids: Vec<String> = self
            .inner
            .consumers
            .lock()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        for id in consumer_ids {
            let _ = self.inner.transport.stop_consume(&id).await;
        }
        if let Ok(mut consumers) = self.inner.consumers.lock() {
            consumers.clear();
        }

        let _ = self.inner.transport.leave().await;
        if let Ok(mut state) = self.inner.state.lock() {
            *state = ClientState::Closed;
        }
        info!(room = %self.inner.room, peer = %self.inner.peer_id, "left media room");
    }

    /// Open a producer; returns a stable local producer id.
    pub async fn produce(&self) -> CoreResult<String> {
        self.ensure_active()?;
        let remote = match self.inner.transport.produce(AudioFormat::Opus48k).await {
            Ok(remote) => remote,
            Err(e) => return Err(self.note_transport_failure(e)),
        };
        let local = Uuid::new_v4().to_string();
        if let Ok(mut producers) = self.inner.producers.lock() {
            producers.insert(local.clone(), remote);
        }
        Ok(local)
    }

    /// Push one audio chunk to a producer, in generation order.
    pub async fn send_audio(&self, local_producer: &str, chunk: &[u8]) -> CoreResult<()> {
        self.ensure_active()?;
        let remote = self
            .inner
            .producers
            .lock()
            .ok()
            .and_then(|p| p.get(local_producer).cloned())
            .ok_or_else(|| CoreError::NotFound(format!("producer {local_producer}")))?;
        match self.inner.transport.send_audio(&remote, chunk).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.note_transport_failure(e)),
        }
    }

    /// Close a producer.
    pub async fn stop_produce(&self, local_producer: &str) -> CoreResult<()> {
        let remote = self
            .inner
            .producers
            .lock()
            .ok()
            .and_then(|mut p| p.remove(local_producer));
        let Some(remote) = remote else {
            return Err(CoreError::NotFound(format!("producer {local_producer}")));
        };
        self.inner.transport.stop_produce(&remote).await
    }

    /// Capture audio from a peer for the configured duration.
    pub async fn consume(&self, source: &str, format: AudioFormat) -> CoreResult<MediaCapture> {
        self.ensure_active()?;
        let capture = match self
            .inner
            .transport
            .consume(source, self.inner.config.consume_duration_ms, format)
            .await
        {
            Ok(capture) => capture,
            Err(e) => return Err(self.note_transport_failure(e)),
        };
        if let Ok(mut consumers) = self.inner.consumers.lock() {
            consumers.insert(capture.consumer_id.clone());
        }
        Ok(capture)
    }

    /// Close a consumer.
    pub async fn stop_consume(&self, consumer_id: &str) -> CoreResult<()> {
        if let Ok(mut consumers) = self.inner.consumers.lock() {
            consumers.remove(consumer_id);
        }
        self.inner.transport.stop_consume(consumer_id).await
    }

    /// List room participants.
    pub async fn list_participants(&self) -> CoreResult<Vec<Participant>> {
        self.ensure_active()?;
        self.inner.transport.list_participants().await
    }

    /// Number of open producers (for tests and stats).
    pub fn open_producers(&self) -> usize {
        self.inner.producers.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Number of open consumers (for tests and stats).
    pub fn open_consumers(&self) -> usize {
        self.inner.consumers.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Mark the link as dropped and launch the supervised reconnect task,
    /// returning the original error.
    fn note_transport_failure(&self, err: CoreError) -> CoreError {
        if !matches!(err, CoreError::TransportUnavailable(_)) {
            return err;
        }
        if self.transition(ClientState::DisconnectedTransient).is_ok() {
            warn!(room = %self.inner.room, "media transport dropped, reconnecting");
            let client = self.clone();
            tokio::spawn(async move {
                client.run_reconnect().await;
            });
        }
        err
    }

    /// Bounded reconnect loop with linear backoff. On success re-joins and
    /// re-advertises producers; on exhaustion closes and signals teardown.
    async fn run_reconnect(&self) {
        let attempts = self.inner.config.reconnect_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.inner.config.backoff * attempt).await;
            if self.state() != ClientState::DisconnectedTransient {
                return; // closed (or recovered) underneath us
            }
            match self
                .inner
                .transport
                .join(&self.inner.room, &self.inner.peer_id)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.readvertise_producers().await {
                        warn!(room = %self.inner.room, attempt, error = %e, "re-advertise failed");
                        continue;
                    }
                    if self.transition(ClientState::Active).is_ok() {
                        info!(room = %self.inner.room, attempt, "media transport recovered");
                    }
                    return;
                }
                Err(e) => {
                    warn!(room = %self.inner.room, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        warn!(
            room = %self.inner.room,
            attempts,
            "media reconnect budget exhausted, tearing down binding"
        );
        if let Ok(mut state) = self.inner.state.lock() {
            *state = ClientState::Closed;
        }
        let _ = self.inner.teardown_tx.send(true);
    }

    /// Recreate server-side producers for every local id after a rejoin.
    async fn readvertise_producers(&self) -> CoreResult<()> {
        let locals: Vec<String> = self
            .inner
            .producers
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        for local in locals {
            let remote = self.inner.transport.produce(AudioFormat::Opus48k).await?;
            if let Ok(mut producers) = self.inner.producers.lock() {
                producers.insert(local, remote);
            }
        }
        Ok(())
    }
}
