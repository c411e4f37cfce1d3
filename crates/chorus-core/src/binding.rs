//! The agent↔room binding: one media client plus the two audio pipelines.
//!
//! A binding exists exactly while an agent is attached to a room. It owns
//! the media-room client handle, the egress and ingress pipelines, the
//! listen loop that feeds room audio through ingress into STT, and the
//! bookkeeping for the agent's currently open producer. Teardown releases
//! everything; nothing survives a detach.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use chorus_audio::{EgressPipeline, IngressPipeline};
use chorus_media::RoomClient;
use chorus_types::{AgentId, RoomId};

/// Media resources owned by one attached agent.
pub struct RoomBinding {
    agent: AgentId,
    room: RoomId,
    client: RoomClient,
    egress: EgressPipeline,
    ingress: IngressPipeline,
    /// Local producer id of the turn currently being spoken, if any.
    current_producer: Mutex<Option<String>>,
    /// Signals the binding's background tasks to stop.
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomBinding {
    /// Assemble a binding from its parts.
    pub fn new(
        agent: AgentId,
        room: RoomId,
        client: RoomClient,
        egress: EgressPipeline,
        ingress: IngressPipeline,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            agent,
            room,
            client,
            egress,
            ingress,
            current_producer: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn client(&self) -> &RoomClient {
        &self.client
    }

    pub fn egress(&self) -> &EgressPipeline {
        &self.egress
    }

    pub fn ingress(&self) -> &IngressPipeline {
        &self.ingress
    }

    /// A receiver that flips to true when the binding is shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Register a background task (listen loop, teardown watcher) so
    /// teardown can stop it.
    pub fn track_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Record the producer for the turn in progress.
    pub fn set_current_producer(&self, producer: Option<String>) {
        if let Ok(mut current) = self.current_producer.lock() {
            *current = producer;
        }
    }

    /// Take the producer for the turn in progress, if any.
    pub fn take_current_producer(&self) -> Option<String> {
        self.current_producer.lock().ok().and_then(|mut c| c.take())
    }

    /// Release every resource the binding owns.
    ///
    /// Safe to call more than once; later calls are no-ops against
    /// already-closed resources.
    pub async fn teardown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.egress.close_input();
        self.ingress.close_input();
        if let Some(producer) = self.take_current_producer() {
            let _ = self.client.stop_produce(&producer).await;
        }
        self.client.leave().await;
        debug!(agent = %self.agent, room = %self.room, "binding torn down");
    }
}
