//! The agent manager: registry, caps, bindings, and the public API.
//!
//! The manager owns every agent record, the agent↔room maps (kept as
//! mutual inverses), and the per-room arbiters. Attach and detach are
//! atomic: either the full binding (media client + both pipelines +
//! arbiter entry) comes up and the maps are updated together, or nothing
//! changes. Events are emitted only after the corresponding state change
//! has been committed.
//!
//! Serialization: one async mutex over the registry makes the manager
//! behave as a serialized actor. Calls into an arbiter happen strictly
//! after the registry lock is released, and the arbiter's calls back in
//! (via [`RuntimeBridge`]) take the lock only for short map lookups, so
//! the two serialization points never wait on each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use chorus_audio::{
    EgressItem, EgressPipeline, IngressPipeline, Transcoder, OPUS_BYTES_PER_SECOND,
};
use chorus_media::{MediaTransport, RoomClient, RoomClientConfig};
use chorus_providers::{LlmProvider, SttProvider, TtsProvider};
use chorus_types::{
    AgentConfig, AgentId, AgentStatus, AttachOptions, AudioFormat, CoreConfig, CoreError,
    CoreEvent, CoreResult, ErrorKind, Message, MessageKind, MessageTarget, RoomId,
};

use crate::agent::{Agent, AgentCell, AgentSnapshot};
use crate::arbiter::{ResponderSelector, RoomArbiter, RoomSnapshot, UniformRandomSelector};
use crate::binding::RoomBinding;
use crate::events::{EventHub, EventStream};
use crate::runtime::VoiceRuntime;

// ---------------------------------------------------------------------------
// Construction inputs
// ---------------------------------------------------------------------------

/// The process-wide provider singletons.
#[derive(Clone)]
pub struct Providers {
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub stt: Arc<dyn SttProvider>,
}

/// Produces a connected media transport for each new binding.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn transport(&self) -> CoreResult<Arc<dyn MediaTransport>>;
}

/// Waits for `rx` to hold `true`, dropping the borrowed `watch::Ref` before
/// returning so the resulting future stays `Send` when used inside
/// `tokio::select!` arms that also await non-`Send` work.
async fn wait_for_true(rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    rx.wait_for(|&v| v).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct AgentEntry {
    cell: AgentCell,
    binding: Option<Arc<RoomBinding>>,
}

struct RoomEntry {
    arbiter: Arc<RoomArbiter>,
    agents: HashSet<AgentId>,
}

#[derive(Default)]
struct Registry {
    agents: HashMap<AgentId, AgentEntry>,
    rooms: HashMap<RoomId, RoomEntry>,
}

struct ManagerInner {
    config: CoreConfig,
    providers: Providers,
    transcoder: Arc<dyn Transcoder>,
    media: Arc<dyn MediaFactory>,
    events: EventHub,
    selector: Arc<dyn ResponderSelector>,
    registry: Mutex<Registry>,
}

/// Aggregate counters surfaced by [`AgentManager::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoreStats {
    pub agents: usize,
    pub rooms: usize,
    pub messages: u64,
    pub llm_calls: u64,
    pub tts_calls: u64,
    pub voice_turns: u64,
}

/// A room's conversation state plus its member set.
#[derive(Debug, Clone, Serialize)]
pub struct RoomView {
    pub agents: Vec<AgentId>,
    #[serde(flatten)]
    pub conversation: RoomSnapshot,
}

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// The front of the core.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    /// Build a manager with the default responder selection strategy.
    pub fn new(
        config: CoreConfig,
        providers: Providers,
        transcoder: Arc<dyn Transcoder>,
        media: Arc<dyn MediaFactory>,
    ) -> CoreResult<Self> {
        Self::with_selector(
            config,
            providers,
            transcoder,
            media,
            Arc::new(UniformRandomSelector),
        )
    }

    /// Build a manager with an explicit responder selection strategy.
    pub fn with_selector(
        config: CoreConfig,
        providers: Providers,
        transcoder: Arc<dyn Transcoder>,
        media: Arc<dyn MediaFactory>,
        selector: Arc<dyn ResponderSelector>,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                providers,
                transcoder,
                media,
                events: EventHub::new(),
                selector,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Attach an observer to the event stream.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// The event hub, for wiring into the bus dispatcher.
    pub fn events(&self) -> EventHub {
        self.inner.events.clone()
    }

    /// The core configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    // -- agent lifecycle --

    /// Create an agent. A missing id gets a generated UUID.
    pub async fn create_agent(
        &self,
        persona: &str,
        id: Option<AgentId>,
        config: Option<AgentConfig>,
    ) -> CoreResult<AgentSnapshot> {
        if persona.trim().is_empty() {
            return Err(CoreError::InvalidArgument("persona must not be empty".into()));
        }
        let id = id.unwrap_or_else(|| AgentId::new(uuid::Uuid::new_v4().to_string()));

        let snapshot = {
            let mut registry = self.inner.registry.lock().await;
            if registry.agents.len() >= self.inner.config.max_agents {
                return Err(CoreError::CapacityExceeded(format!(
                    "process agent cap of {} reached",
                    self.inner.config.max_agents
                )));
            }
            if registry.agents.contains_key(&id) {
                return Err(CoreError::AlreadyExists(format!("agent {id}")));
            }
            let agent = Agent::new(
                id.clone(),
                persona.to_string(),
                config.unwrap_or_default(),
                self.inner.config.history_cap,
                self.inner.config.speech_queue_cap,
            );
            let cell = AgentCell::new(agent, self.inner.events.clone());
            let snapshot = cell.snapshot().await;
            registry.agents.insert(
                id.clone(),
                AgentEntry {
                    cell,
                    binding: None,
                },
            );
            snapshot
        };

        info!(agent = %id, "agent created");
        self.inner.events.emit(CoreEvent::AgentCreated {
            agent: id,
            ts: Utc::now(),
        });
        Ok(snapshot)
    }

    /// Destroy an agent, detaching it from its room first.
    pub async fn delete_agent(&self, id: &AgentId) -> CoreResult<()> {
        // Best-effort detach; "not attached" is fine here.
        match self.detach_agent_from_room(id).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::InvalidArgument => {}
            Err(e) => return Err(e),
        }

        {
            let mut registry = self.inner.registry.lock().await;
            if registry.agents.remove(id).is_none() {
                return Err(CoreError::NotFound(format!("agent {id}")));
            }
        }
        info!(agent = %id, "agent deleted");
        self.inner.events.emit(CoreEvent::AgentDeleted {
            agent: id.clone(),
            ts: Utc::now(),
        });
        Ok(())
    }

    /// Replace an agent's configuration. History survives.
    pub async fn update_agent(&self, id: &AgentId, config: AgentConfig) -> CoreResult<()> {
        if !self.inner.providers.tts.supports_voice(&config.voice.voice) {
            return Err(CoreError::InvalidArgument(format!(
                "unsupported voice '{}'",
                config.voice.voice
            )));
        }
        let cell = self.cell(id).await?;
        cell.with(|agent| agent.update_config(config)).await;
        self.inner.events.emit(CoreEvent::AgentUpdated {
            agent: id.clone(),
            ts: Utc::now(),
        });
        Ok(())
    }

    // -- room binding --

    /// Attach an agent to a room, building the full binding atomically.
    pub async fn attach_agent_to_room(
        &self,
        id: &AgentId,
        room: &RoomId,
        opts: AttachOptions,
    ) -> CoreResult<()> {
        if room.as_str().trim().is_empty() {
            return Err(CoreError::InvalidArgument("room id must not be empty".into()));
        }

        let (binding, arbiter) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry
                .agents
                .get(id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            if entry.binding.is_some() {
                return Err(CoreError::AlreadyExists(format!(
                    "agent {id} is already attached to a room"
                )));
            }
            let occupancy = registry.rooms.get(room).map_or(0, |r| r.agents.len());
            if occupancy >= self.inner.config.max_agents_per_room {
                return Err(CoreError::CapacityExceeded(format!(
                    "room {room} cap of {} reached",
                    self.inner.config.max_agents_per_room
                )));
            }

            // Build the media side first; any failure here leaves every
            // map untouched.
            let transport = self.inner.media.transport().await?;
            let client = RoomClient::new(
                transport,
                room.clone(),
                id.as_str(),
                RoomClientConfig {
                    reconnect_attempts: self.inner.config.media_reconnect_attempts,
                    backoff: Duration::from_millis(1_000),
                    consume_duration_ms: 5_000,
                },
            );
            client.join().await?;

            let egress = EgressPipeline::new(
                Arc::clone(&self.inner.transcoder),
                self.inner.config.egress_buffer_bytes,
            );
            let ingress = IngressPipeline::new(
                Arc::clone(&self.inner.transcoder),
                self.inner.config.ingress_bucket_ms,
                self.inner.config.vad_rms_threshold,
            );
            let binding = RoomBinding::new(id.clone(), room.clone(), client, egress, ingress);

            let arbiter = match registry.rooms.get(room) {
                Some(entry) => Arc::clone(&entry.arbiter),
                None => {
                    let arbiter = Arc::new(RoomArbiter::spawn(
                        room.clone(),
                        Arc::new(RuntimeBridge {
                            inner: Arc::downgrade(&self.inner),
                        }),
                        self.inner.events.clone(),
                        self.inner.config.clone(),
                        Arc::clone(&self.inner.selector),
                    ));
                    registry.rooms.insert(
                        room.clone(),
                        RoomEntry {
                            arbiter: Arc::clone(&arbiter),
                            agents: HashSet::new(),
                        },
                    );
                    arbiter
                }
            };

            // Commit: both maps move together.
            if let Some(room_entry) = registry.rooms.get_mut(room) {
                room_entry.agents.insert(id.clone());
            }
            let entry = registry
                .agents
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            entry.binding = Some(Arc::clone(&binding));
            entry.cell.with(|agent| agent.set_room(Some(room.clone()))).await;

            (binding, arbiter)
        };

        // Supervise media teardown: budget exhaustion detaches the agent.
        {
            let mut signal = binding.client().teardown_signal();
            let manager = Arc::downgrade(&self.inner);
            let agent_id = id.clone();
            let mut shutdown = binding.shutdown_signal();
            let watcher = tokio::spawn(async move {
                tokio::select! {
                    _ = wait_for_true(&mut shutdown) => {}
                    result = wait_for_true(&mut signal) => {
                        if result.is_ok() {
                            if let Some(inner) = manager.upgrade() {
                                AgentManager { inner }.handle_media_failure(&agent_id).await;
                            }
                        }
                    }
                }
            });
            binding.track_task(watcher);
        }

        // Listen path: room audio → ingress → STT → arbiter transcripts.
        if opts.start_listening {
            self.spawn_listen_tasks(&binding, &arbiter).await;
            self.cell(id).await?.set_status(AgentStatus::Listening).await;
        }
        info!(agent = %id, room = %room, "agent attached to room");
        self.inner.events.emit(CoreEvent::RoomJoined {
            agent: id.clone(),
            room: room.clone(),
            ts: Utc::now(),
        });
        Ok(())
    }

    /// Detach an agent from its room, releasing the binding.
    pub async fn detach_agent_from_room(&self, id: &AgentId) -> CoreResult<()> {
        self.detach(id, None).await
    }

    async fn detach(&self, id: &AgentId, error: Option<ErrorKind>) -> CoreResult<()> {
        let (binding, arbiter, room, drop_room) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry
                .agents
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            let Some(binding) = entry.binding.take() else {
                return Err(CoreError::InvalidArgument(format!(
                    "agent {id} is not attached to a room"
                )));
            };
            entry.cell.with(|agent| agent.set_room(None)).await;

            let room = binding.room().clone();
            let mut drop_room = false;
            let arbiter = if let Some(room_entry) = registry.rooms.get_mut(&room) {
                room_entry.agents.remove(id);
                let arbiter = Arc::clone(&room_entry.arbiter);
                if room_entry.agents.is_empty() {
                    registry.rooms.remove(&room);
                    drop_room = true;
                }
                Some(arbiter)
            } else {
                None
            };
            (binding, arbiter, room, drop_room)
        };

        if let Some(arbiter) = &arbiter {
            arbiter.agent_detached(id.clone()).await;
        }
        binding.teardown().await;
        if drop_room {
            if let Some(arbiter) = &arbiter {
                arbiter.shutdown().await;
            }
            debug!(room = %room, "last agent left, room destroyed");
        }
        if let Ok(cell) = self.cell(id).await {
            cell.set_status(AgentStatus::Idle).await;
        }

        info!(agent = %id, room = %room, forced = error.is_some(), "agent detached from room");
        self.inner.events.emit(CoreEvent::RoomLeft {
            agent: id.clone(),
            room,
            error,
            ts: Utc::now(),
        });
        Ok(())
    }

    /// Media reconnect budget exhausted: tear the binding down and
    /// announce the forced departure.
    async fn handle_media_failure(&self, id: &AgentId) {
        warn!(agent = %id, "media unrecoverable, detaching agent");
        let _ = self.detach(id, Some(ErrorKind::MediaUnrecoverable)).await;
    }

    // -- speaking --

    /// Request a speaking turn for an agent in its room.
    pub async fn request_speak(&self, id: &AgentId, text: &str) -> CoreResult<()> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidArgument("speak text is empty".into()));
        }
        let arbiter = self.arbiter_of(id).await?;
        arbiter.request_speak(id.clone(), text.to_string()).await
    }

    /// Cancel an agent's current or queued speaking turn.
    pub async fn cancel_speak(&self, id: &AgentId) -> CoreResult<()> {
        let arbiter = self.arbiter_of(id).await?;
        arbiter.cancel_speak(id.clone()).await
    }

    /// Feed a finalized external transcript into a room.
    pub async fn ingest_transcript(
        &self,
        room: &RoomId,
        session: &str,
        text: &str,
        confidence: f32,
    ) -> CoreResult<()> {
        let arbiter = {
            let registry = self.inner.registry.lock().await;
            let entry = registry
                .rooms
                .get(room)
                .ok_or_else(|| CoreError::NotFound(format!("room {room}")))?;
            Arc::clone(&entry.arbiter)
        };
        arbiter
            .ingest_transcript(session.to_string(), text.to_string(), confidence)
            .await;
        Ok(())
    }

    /// Direct text exchange with an agent.
    pub async fn process_text(
        &self,
        id: &AgentId,
        text: &str,
        from: &str,
    ) -> CoreResult<Message> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidArgument("message text is empty".into()));
        }
        let (cell, attached) = {
            let registry = self.inner.registry.lock().await;
            let entry = registry
                .agents
                .get(id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            (entry.cell.clone(), entry.binding.is_some())
        };
        let rest = if attached {
            AgentStatus::Listening
        } else {
            AgentStatus::Idle
        };
        let inbound = Message::new(
            MessageKind::InboundText,
            text,
            from,
            MessageTarget::Agent(id.clone()),
        );
        cell.process_text(&self.inner.providers.llm, inbound, rest)
            .await
    }

    // -- introspection --

    /// Snapshots of all agents.
    pub async fn list_agents(&self) -> Vec<AgentSnapshot> {
        let cells: Vec<AgentCell> = {
            let registry = self.inner.registry.lock().await;
            registry.agents.values().map(|e| e.cell.clone()).collect()
        };
        let mut snapshots = Vec::with_capacity(cells.len());
        for cell in cells {
            snapshots.push(cell.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Snapshot of one agent.
    pub async fn get_agent(&self, id: &AgentId) -> CoreResult<AgentSnapshot> {
        Ok(self.cell(id).await?.snapshot().await)
    }

    /// A room's members and conversation state.
    pub async fn get_room(&self, room: &RoomId) -> CoreResult<RoomView> {
        let (arbiter, mut agents) = {
            let registry = self.inner.registry.lock().await;
            let entry = registry
                .rooms
                .get(room)
                .ok_or_else(|| CoreError::NotFound(format!("room {room}")))?;
            (
                Arc::clone(&entry.arbiter),
                entry.agents.iter().cloned().collect::<Vec<_>>(),
            )
        };
        agents.sort();
        let conversation = arbiter.snapshot().await?;
        Ok(RoomView {
            agents,
            conversation,
        })
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> CoreStats {
        let snapshots = self.list_agents().await;
        let rooms = self.inner.registry.lock().await.rooms.len();
        let mut stats = CoreStats {
            agents: snapshots.len(),
            rooms,
            ..CoreStats::default()
        };
        for snap in snapshots {
            stats.messages += snap.metrics.messages;
            stats.llm_calls += snap.metrics.llm_calls;
            stats.tts_calls += snap.metrics.tts_calls;
            stats.voice_turns += snap.metrics.voice_turns;
        }
        stats
    }

    /// Detach every agent and drop the registry. Restart is a cold start.
    pub async fn shutdown(&self) {
        let ids: Vec<AgentId> = {
            let registry = self.inner.registry.lock().await;
            registry.agents.keys().cloned().collect()
        };
        for id in &ids {
            let _ = self.detach_agent_from_room(id).await;
        }
        let mut registry = self.inner.registry.lock().await;
        registry.agents.clear();
        registry.rooms.clear();
        info!("agent manager shut down");
    }

    // -- internals --

    async fn cell(&self, id: &AgentId) -> CoreResult<AgentCell> {
        let registry = self.inner.registry.lock().await;
        registry
            .agents
            .get(id)
            .map(|e| e.cell.clone())
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn arbiter_of(&self, id: &AgentId) -> CoreResult<Arc<RoomArbiter>> {
        let registry = self.inner.registry.lock().await;
        let entry = registry
            .agents
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        let binding = entry.binding.as_ref().ok_or_else(|| {
            CoreError::InvalidArgument(format!("agent {id} is not attached to a room"))
        })?;
        let room_entry = registry.rooms.get(binding.room()).ok_or_else(|| {
            CoreError::NotFound(format!("room {} for agent {id}", binding.room()))
        })?;
        Ok(Arc::clone(&room_entry.arbiter))
    }

    /// Start the capture → ingress → STT → arbiter chain for a binding.
    async fn spawn_listen_tasks(&self, binding: &Arc<RoomBinding>, arbiter: &Arc<RoomArbiter>) {
        let session = format!("{}-s{}", binding.room(), binding.agent());

        // Capture loop: pull room audio into the ingress pipeline.
        {
            let binding_for_capture = Arc::clone(binding);
            let mut shutdown = binding_for_capture.shutdown_signal();
            let capture = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = wait_for_true(&mut shutdown) => break,
                        captured = binding_for_capture.client().consume("room-mix", AudioFormat::Opus48k) => {
                            match captured {
                                Ok(capture) => {
                                    let _ = binding_for_capture.client().stop_consume(&capture.consumer_id).await;
                                    if !capture.audio.is_empty() {
                                        if binding_for_capture
                                            .ingress()
                                            .push(capture.audio, capture.format)
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                }
                                Err(e) if e.kind() == ErrorKind::MediaUnrecoverable => break,
                                Err(e) => {
                                    debug!(error = %e, "room capture failed, retrying");
                                    tokio::time::sleep(Duration::from_millis(500)).await;
                                }
                            }
                        }
                    }
                }
            });
            binding.track_task(capture);
        }

        // STT loop: voiced ingress buckets feed a streaming session whose
        // finals land on the arbiter as transcripts.
        match self
            .inner
            .providers
            .stt
            .open_stream(&session, "en")
            .await
        {
            Ok(mut stream) => {
                let sink = stream.sink();
                let binding_for_feed = Arc::clone(binding);
                if let Some(sink) = sink {
                    let feed = tokio::spawn(async move {
                        while let Some(chunk) = binding_for_feed.ingress().next_chunk().await {
                            if chunk.is_voice && sink.send(chunk.pcm).await.is_err() {
                                break;
                            }
                        }
                    });
                    binding.track_task(feed);
                }

                let arbiter = Arc::clone(arbiter);
                let session_name = session.clone();
                let mut shutdown = binding.shutdown_signal();
                let events = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = wait_for_true(&mut shutdown) => break,
                            event = stream.next_event() => {
                                let Some(event) = event else { break };
                                if event.is_final {
                                    arbiter
                                        .ingest_transcript(
                                            session_name.clone(),
                                            event.text,
                                            event.confidence,
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                });
                binding.track_task(events);
            }
            Err(e) => {
                warn!(session = %session, error = %e, "stt stream unavailable, listening without transcripts");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeBridge: the arbiter's window into the manager
// ---------------------------------------------------------------------------

/// Weak bridge so arbiters never keep the manager alive.
struct RuntimeBridge {
    inner: Weak<ManagerInner>,
}

impl RuntimeBridge {
    fn manager(&self) -> Option<AgentManager> {
        self.inner.upgrade().map(|inner| AgentManager { inner })
    }
}

#[async_trait]
impl VoiceRuntime for RuntimeBridge {
    async fn speak(
        &self,
        room: &RoomId,
        agent: &AgentId,
        text: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> CoreResult<()> {
        let Some(manager) = self.manager() else {
            return Err(CoreError::Cancelled("manager is gone".into()));
        };
        let inner = &manager.inner;

        let (cell, binding) = {
            let registry = inner.registry.lock().await;
            let entry = registry
                .agents
                .get(agent)
                .ok_or_else(|| CoreError::NotFound(format!("agent {agent}")))?;
            let binding = entry
                .binding
                .clone()
                .filter(|b| b.room() == room)
                .ok_or_else(|| {
                    CoreError::InvalidArgument(format!("agent {agent} is not bound to room {room}"))
                })?;
            (entry.cell.clone(), binding)
        };

        let voice = cell
            .with(|a| {
                a.count_tts_call();
                a.config().voice.clone()
            })
            .await;

        // Synthesis, bounded by the TTS timeout.
        let tts_deadline = Duration::from_millis(inner.config.tts_timeout_ms);
        let audio = tokio::time::timeout(tts_deadline, inner.providers.tts.synthesize(text, &voice))
            .await
            .map_err(|_| CoreError::ProviderError("tts call timed out".into()))??;

        cell.record_message(Message::new(
            MessageKind::OutboundVoice,
            text,
            agent.as_str(),
            MessageTarget::Broadcast,
        ))
        .await;

        // A force-stopped predecessor may have left unconsumed items on
        // the egress output; this turn must start clean.
        while binding.egress().output().try_pop().is_some() {}

        // Convert and stream into the room, paced at roughly real time.
        binding.egress().push(audio.bytes, audio.format).await?;
        let producer = binding.client().produce().await?;
        binding.set_current_producer(Some(producer.clone()));

        let chunk_pacing = Duration::from_millis(
            (inner.config.egress_buffer_bytes.max(1) as u64 * 1_000)
                / OPUS_BYTES_PER_SECOND as u64,
        );
        let result = loop {
            tokio::select! {
                item = binding.egress().next_item() => match item {
                    Some(EgressItem::Chunk(chunk)) => {
                        if let Err(e) = binding.client().send_audio(&producer, &chunk).await {
                            break Err(e);
                        }
                        tokio::time::sleep(chunk_pacing).await;
                    }
                    Some(EgressItem::UtteranceEnd) | None => break Ok(()),
                },
                _ = wait_for_true(&mut cancel) => {
                    break Err(CoreError::Cancelled("speaking turn cancelled".into()));
                }
            }
        };

        binding.set_current_producer(None);
        let _ = binding.client().stop_produce(&producer).await;
        result
    }

    async fn stop_speaking(&self, _room: &RoomId, agent: &AgentId) {
        let Some(manager) = self.manager() else {
            return;
        };
        let binding = {
            let registry = manager.inner.registry.lock().await;
            registry
                .agents
                .get(agent)
                .and_then(|e| e.binding.clone())
        };
        if let Some(binding) = binding {
            if let Some(producer) = binding.take_current_producer() {
                let _ = binding.client().stop_produce(&producer).await;
            }
        }
    }

    async fn respond(
        &self,
        agent: &AgentId,
        transcript: &str,
        origin: &str,
    ) -> CoreResult<String> {
        let Some(manager) = self.manager() else {
            return Err(CoreError::Cancelled("manager is gone".into()));
        };
        let inner = &manager.inner;
        let cell = manager.cell(agent).await?;

        cell.record_message(
            Message::new(
                MessageKind::InboundVoice,
                transcript,
                origin,
                MessageTarget::Agent(agent.clone()),
            ),
        )
        .await;

        let (persona, mut turns, params) = cell
            .with(|a| {
                a.count_llm_call();
                (
                    a.persona().to_string(),
                    a.chat_turns(),
                    a.config().llm.clone(),
                )
            })
            .await;
        // Voice entries are filtered out of prompt history, so the
        // transcript being answered goes in as an explicit final turn.
        turns.push(chorus_providers::ChatTurn::user(origin, transcript));

        let llm_deadline = Duration::from_millis(inner.config.llm_timeout_ms);
        let started = std::time::Instant::now();
        let reply = tokio::time::timeout(
            llm_deadline,
            inner
                .providers
                .llm
                .generate(agent.as_str(), &persona, &turns, &params),
        )
        .await
        .map_err(|_| CoreError::ProviderError("llm call timed out".into()))??;

        if reply.text.trim().is_empty() {
            return Ok(String::new());
        }
        cell.record_message(
            Message::new(
                MessageKind::OutboundText,
                reply.text.clone(),
                agent.as_str(),
                MessageTarget::Broadcast,
            )
            .with_latency_ms(started.elapsed().as_millis() as u64)
            .with_model_tag(reply.model_tag.clone()),
        )
        .await;
        Ok(reply.text)
    }

    async fn set_status(&self, agent: &AgentId, status: AgentStatus) {
        if let Some(manager) = self.manager() {
            if let Ok(cell) = manager.cell(agent).await {
                cell.set_status(status).await;
            }
        }
    }

    async fn status_of(&self, agent: &AgentId) -> Option<AgentStatus> {
        let manager = self.manager()?;
        let cell = manager.cell(agent).await.ok()?;
        Some(cell.status().await)
    }

    async fn is_attached(&self, agent: &AgentId, room: &RoomId) -> bool {
        let Some(manager) = self.manager() else {
            return false;
        };
        let registry = manager.inner.registry.lock().await;
        registry
            .agents
            .get(agent)
            .and_then(|e| e.binding.as_ref())
            .is_some_and(|b| b.room() == room)
    }

    async fn listening_agents(&self, room: &RoomId) -> Vec<AgentId> {
        let Some(manager) = self.manager() else {
            return Vec::new();
        };
        let cells: Vec<(AgentId, AgentCell)> = {
            let registry = manager.inner.registry.lock().await;
            let Some(room_entry) = registry.rooms.get(room) else {
                return Vec::new();
            };
            room_entry
                .agents
                .iter()
                .filter_map(|id| {
                    registry
                        .agents
                        .get(id)
                        .map(|e| (id.clone(), e.cell.clone()))
                })
                .collect()
        };
        let mut listening = Vec::new();
        for (id, cell) in cells {
            if cell.status().await.is_eligible_responder() {
                listening.push(id);
            }
        }
        listening.sort();
        listening
    }

    async fn queue_speech(&self, agent: &AgentId, text: &str) -> CoreResult<()> {
        let Some(manager) = self.manager() else {
            return Err(CoreError::Cancelled("manager is gone".into()));
        };
        let cell = manager.cell(agent).await?;
        cell.with(|a| a.queue_speech(text.to_string())).await
    }

    async fn pop_queued_speech(&self, agent: &AgentId) -> Option<String> {
        let manager = self.manager()?;
        let cell = manager.cell(agent).await.ok()?;
        cell.with(|a| a.pop_speech()).await
    }

    async fn count_voice_turn(&self, agent: &AgentId) {
        if let Some(manager) = self.manager() {
            if let Ok(cell) = manager.cell(agent).await {
                cell.with(|a| a.count_voice_turn()).await;
            }
        }
    }
}
