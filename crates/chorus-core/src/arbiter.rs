//! Per-room turn arbitration.
//!
//! Each room runs one [`RoomArbiter`]: a serialized command loop owning
//! the current speaker, the FIFO turn queue, the speaking timer, and the
//! room's conversation log. Long-running work (synthesis, media
//! streaming, LLM replies) runs in spawned tasks whose completions come
//! back as commands, so the loop itself never blocks on a provider.
//!
//! ```text
//! idle ──request-to-speak──▶ speaking(agent, t0)
//!                                │ another request: enqueue (FIFO, cap)
//!                                ├── finished / cancelled ──▶ idle, drain queue
//!                                └── timer expired ──▶ force-stop, idle, drain queue
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chorus_types::{
    AgentId, AgentStatus, CoreConfig, CoreError, CoreEvent, CoreResult, RoomId, SpeakingEndReason,
};

use crate::events::EventHub;
use crate::runtime::VoiceRuntime;

/// Arbiter command channel depth.
const CMD_QUEUE_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Conversation log
// ---------------------------------------------------------------------------

/// One entry in a room's conversation log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEntry {
    /// A transcription heard in the room.
    Transcript {
        origin: String,
        text: String,
        confidence: f32,
        ts: DateTime<Utc>,
    },
    /// An utterance an agent started speaking.
    Utterance {
        agent: AgentId,
        text: String,
        ts: DateTime<Utc>,
    },
    /// The arbiter force-stopped a speaker at the time limit.
    ForcedStop { agent: AgentId, ts: DateTime<Utc> },
    /// A selected responder failed to produce a reply.
    Declined { agent: AgentId, ts: DateTime<Utc> },
}

// ---------------------------------------------------------------------------
// Responder selection
// ---------------------------------------------------------------------------

/// Replaceable strategy for picking which listening agent answers a
/// transcript.
pub trait ResponderSelector: Send + Sync {
    fn select(&self, candidates: &[AgentId]) -> Option<AgentId>;
}

/// Uniform-random selection among eligible agents.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRandomSelector;

impl ResponderSelector for UniformRandomSelector {
    fn select(&self, candidates: &[AgentId]) -> Option<AgentId> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only view of a room's conversation state.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room: RoomId,
    pub current_speaker: Option<AgentId>,
    pub speaking_since: Option<DateTime<Utc>>,
    pub queue: Vec<AgentId>,
    pub log: Vec<ConversationEntry>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Cmd {
    RequestSpeak {
        agent: AgentId,
        text: String,
        reply: Option<oneshot::Sender<CoreResult<()>>>,
    },
    CancelSpeak {
        agent: AgentId,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    TurnFinished {
        seq: u64,
        outcome: CoreResult<()>,
    },
    TimerExpired {
        seq: u64,
    },
    Transcript {
        origin: String,
        text: String,
        confidence: f32,
    },
    ReplyReady {
        agent: AgentId,
        result: CoreResult<String>,
    },
    AgentDetached {
        agent: AgentId,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// RoomArbiter handle
// ---------------------------------------------------------------------------

/// Handle to one room's arbitration loop.
pub struct RoomArbiter {
    room: RoomId,
    cmd_tx: mpsc::Sender<Cmd>,
    task: JoinHandle<()>,
}

impl RoomArbiter {
    /// Spawn the arbitration loop for a room.
    pub fn spawn(
        room: RoomId,
        runtime: Arc<dyn VoiceRuntime>,
        events: EventHub,
        config: CoreConfig,
        selector: Arc<dyn ResponderSelector>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_CAP);
        let state = Loop {
            room: room.clone(),
            runtime,
            events,
            config,
            selector,
            cmd_tx: cmd_tx.clone(),
            current: None,
            seq: 0,
            queue: VecDeque::new(),
            log: VecDeque::new(),
        };
        let task = tokio::spawn(state.run(cmd_rx));
        Self { room, cmd_tx, task }
    }

    /// The room this arbiter serves.
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Request a speaking turn; queues FIFO behind a current speaker.
    pub async fn request_speak(&self, agent: AgentId, text: String) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::RequestSpeak {
            agent,
            text,
            reply: Some(tx),
        })
        .await?;
        rx.await
            .map_err(|_| CoreError::Cancelled("arbiter is gone".into()))?
    }

    /// Cancel the agent's current turn or queued request.
    pub async fn cancel_speak(&self, agent: AgentId) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::CancelSpeak { agent, reply: tx }).await?;
        rx.await
            .map_err(|_| CoreError::Cancelled("arbiter is gone".into()))?
    }

    /// Feed a finalized transcript into the room.
    pub async fn ingest_transcript(&self, origin: String, text: String, confidence: f32) {
        let _ = self
            .send(Cmd::Transcript {
                origin,
                text,
                confidence,
            })
            .await;
    }

    /// Tell the arbiter an agent left the room.
    pub async fn agent_detached(&self, agent: AgentId) {
        let _ = self.send(Cmd::AgentDetached { agent }).await;
    }

    /// Snapshot of the conversation state.
    pub async fn snapshot(&self) -> CoreResult<RoomSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Snapshot { reply: tx }).await?;
        rx.await
            .map_err(|_| CoreError::Cancelled("arbiter is gone".into()))
    }

    /// Stop the loop, force-stopping any current speaker. The loop exits
    /// after processing commands already queued ahead of the shutdown.
    pub async fn shutdown(&self) {
        let _ = self.send(Cmd::Shutdown).await;
    }

    async fn send(&self, cmd: Cmd) -> CoreResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CoreError::Cancelled(format!("arbiter for room {} is gone", self.room)))
    }
}

impl Drop for RoomArbiter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

struct CurrentTurn {
    agent: AgentId,
    seq: u64,
    started_at: DateTime<Utc>,
    cancel_tx: watch::Sender<bool>,
    speak_task: JoinHandle<()>,
    timer: JoinHandle<()>,
}

struct Loop {
    room: RoomId,
    runtime: Arc<dyn VoiceRuntime>,
    events: EventHub,
    config: CoreConfig,
    selector: Arc<dyn ResponderSelector>,
    cmd_tx: mpsc::Sender<Cmd>,
    current: Option<CurrentTurn>,
    seq: u64,
    queue: VecDeque<(AgentId, String)>,
    log: VecDeque<ConversationEntry>,
}

impl Loop {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        info!(room = %self.room, "room arbiter started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::RequestSpeak { agent, text, reply } => {
                    let result = self.handle_request_speak(agent, text).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Cmd::CancelSpeak { agent, reply } => {
                    let result = self.handle_cancel(agent).await;
                    let _ = reply.send(result);
                }
                Cmd::TurnFinished { seq, outcome } => {
                    self.handle_turn_finished(seq, outcome).await;
                }
                Cmd::TimerExpired { seq } => {
                    self.handle_timer_expired(seq).await;
                }
                Cmd::Transcript {
                    origin,
                    text,
                    confidence,
                } => {
                    self.handle_transcript(origin, text, confidence).await;
                }
                Cmd::ReplyReady { agent, result } => {
                    self.handle_reply_ready(agent, result).await;
                }
                Cmd::AgentDetached { agent } => {
                    self.handle_agent_detached(agent).await;
                }
                Cmd::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Cmd::Shutdown => break,
            }
        }
        if self.current.is_some() {
            self.force_stop(SpeakingEndReason::Cancelled).await;
        }
        info!(room = %self.room, "room arbiter stopped");
    }

    // -- speak requests --

    async fn handle_request_speak(&mut self, agent: AgentId, text: String) -> CoreResult<()> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidArgument("speak text is empty".into()));
        }

        // A repeat request from the current speaker or an already queued
        // agent stacks on the agent's own bounded speech queue.
        let already_pending = self
            .current
            .as_ref()
            .is_some_and(|c| c.agent == agent)
            || self.queue.iter().any(|(a, _)| *a == agent);
        if already_pending {
            return self.runtime.queue_speech(&agent, &text).await;
        }

        if self.current.is_none() {
            self.start_turn(agent, text).await;
            return Ok(());
        }

        if self.queue.len() >= self.config.turn_queue_cap {
            return Err(CoreError::Busy(format!(
                "turn queue for room {} is full ({} pending)",
                self.room,
                self.queue.len()
            )));
        }
        self.queue.push_back((agent, text));
        Ok(())
    }

    async fn start_turn(&mut self, agent: AgentId, text: String) {
        self.seq += 1;
        let seq = self.seq;
        let started_at = Utc::now();

        self.runtime.set_status(&agent, AgentStatus::Speaking).await;
        self.push_log(ConversationEntry::Utterance {
            agent: agent.clone(),
            text: text.clone(),
            ts: started_at,
        });
        self.events.emit(CoreEvent::SpeakingStart {
            agent: agent.clone(),
            room: self.room.clone(),
            text: text.clone(),
            ts: started_at,
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);

        let runtime = Arc::clone(&self.runtime);
        let cmd_tx = self.cmd_tx.clone();
        let room = self.room.clone();
        let speak_agent = agent.clone();
        let speak_task = tokio::spawn(async move {
            let outcome = runtime
                .speak(&room, &speak_agent, &text, cancel_rx)
                .await;
            let _ = cmd_tx.send(Cmd::TurnFinished { seq, outcome }).await;
        });

        let limit = Duration::from_millis(self.config.speaking_time_limit_ms);
        let timer_tx = self.cmd_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = timer_tx.send(Cmd::TimerExpired { seq }).await;
        });

        debug!(room = %self.room, agent = %agent, seq, "speaking turn started");
        self.current = Some(CurrentTurn {
            agent,
            seq,
            started_at,
            cancel_tx,
            speak_task,
            timer,
        });
    }

    async fn handle_turn_finished(&mut self, seq: u64, outcome: CoreResult<()>) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        if current.seq != seq {
            return; // stale completion from an already force-stopped turn
        }
        let reason = match &outcome {
            Ok(()) => SpeakingEndReason::Completed,
            Err(e) => {
                warn!(room = %self.room, agent = %current.agent, error = %e, "speaking turn failed");
                SpeakingEndReason::Error
            }
        };
        self.end_turn(reason).await;
    }

    async fn handle_timer_expired(&mut self, seq: u64) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        if current.seq != seq {
            return;
        }
        warn!(
            room = %self.room,
            agent = %current.agent,
            limit_ms = self.config.speaking_time_limit_ms,
            "speaking time limit reached, force-stopping"
        );
        self.force_stop(SpeakingEndReason::ForcedStop).await;
    }

    async fn handle_cancel(&mut self, agent: AgentId) -> CoreResult<()> {
        if self.current.as_ref().is_some_and(|c| c.agent == agent) {
            self.force_stop(SpeakingEndReason::Cancelled).await;
            return Ok(());
        }
        let before = self.queue.len();
        self.queue.retain(|(a, _)| *a != agent);
        if self.queue.len() < before {
            return Ok(());
        }
        Err(CoreError::NotFound(format!(
            "agent {agent} is neither speaking nor queued in room {}",
            self.room
        )))
    }

    /// Interrupt the current turn: stop production, announce the end, and
    /// move on. Used for the time limit, explicit cancels, and detaches.
    async fn force_stop(&mut self, reason: SpeakingEndReason) {
        let Some(current) = self.current.take() else {
            return;
        };
        let _ = current.cancel_tx.send(true);
        current.speak_task.abort();
        current.timer.abort();
        self.runtime.stop_speaking(&self.room, &current.agent).await;
        if reason == SpeakingEndReason::ForcedStop {
            self.push_log(ConversationEntry::ForcedStop {
                agent: current.agent.clone(),
                ts: Utc::now(),
            });
        }
        self.finish(current.agent, reason).await;
    }

    /// Normal end of the current turn (completed or failed on its own).
    async fn end_turn(&mut self, reason: SpeakingEndReason) {
        let Some(current) = self.current.take() else {
            return;
        };
        current.timer.abort();
        if reason == SpeakingEndReason::Completed {
            self.runtime.count_voice_turn(&current.agent).await;
        }
        self.finish(current.agent, reason).await;
    }

    async fn finish(&mut self, agent: AgentId, reason: SpeakingEndReason) {
        // Back to listening, unless the agent left or was deleted in the
        // meantime.
        if self.runtime.status_of(&agent).await == Some(AgentStatus::Speaking) {
            self.runtime.set_status(&agent, AgentStatus::Listening).await;
        }
        self.events.emit(CoreEvent::SpeakingEnd {
            agent: agent.clone(),
            room: self.room.clone(),
            reason,
            ts: Utc::now(),
        });
        debug!(room = %self.room, agent = %agent, ?reason, "speaking turn ended");

        // The agent's own stash re-enters the room queue FIFO.
        if let Some(next_text) = self.runtime.pop_queued_speech(&agent).await {
            if self.queue.len() < self.config.turn_queue_cap {
                self.queue.push_back((agent, next_text));
            } else {
                warn!(room = %self.room, agent = %agent, "turn queue full, stashed speech dropped");
            }
        }

        self.drain_queue().await;
    }

    /// Start the next queued turn, dropping entries whose agent left.
    async fn drain_queue(&mut self) {
        if self.current.is_some() {
            return;
        }
        while let Some((agent, text)) = self.queue.pop_front() {
            if self.runtime.is_attached(&agent, &self.room).await {
                self.start_turn(agent, text).await;
                return;
            }
            debug!(room = %self.room, agent = %agent, "dropping queued turn for detached agent");
        }
    }

    // -- transcripts --

    async fn handle_transcript(&mut self, origin: String, text: String, confidence: f32) {
        let ts = Utc::now();
        self.push_log(ConversationEntry::Transcript {
            origin: origin.clone(),
            text: text.clone(),
            confidence,
            ts,
        });
        self.events.emit(CoreEvent::TranscriptionUpdate {
            room: self.room.clone(),
            session: origin.clone(),
            text: text.clone(),
            confidence,
            ts,
        });

        if confidence < self.config.confidence_floor {
            debug!(
                room = %self.room,
                confidence,
                floor = self.config.confidence_floor,
                "transcript below confidence floor, logged only"
            );
            return;
        }
        if self.current.is_some() {
            // Someone is talking; the transcript stays in the log only.
            return;
        }

        let candidates = self.runtime.listening_agents(&self.room).await;
        let Some(responder) = self.selector.select(&candidates) else {
            debug!(room = %self.room, "no eligible responder for transcript");
            return;
        };

        self.runtime
            .set_status(&responder, AgentStatus::Thinking)
            .await;
        let runtime = Arc::clone(&self.runtime);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = runtime.respond(&responder, &text, &origin).await;
            let _ = cmd_tx
                .send(Cmd::ReplyReady {
                    agent: responder,
                    result,
                })
                .await;
        });
    }

    async fn handle_reply_ready(&mut self, agent: AgentId, result: CoreResult<String>) {
        if self.runtime.status_of(&agent).await == Some(AgentStatus::Thinking) {
            self.runtime.set_status(&agent, AgentStatus::Listening).await;
        }
        match result {
            Ok(text) if !text.trim().is_empty() => {
                if let Err(e) = self.handle_request_speak(agent.clone(), text).await {
                    warn!(room = %self.room, agent = %agent, error = %e, "responder speak rejected");
                }
            }
            Ok(_) => {
                debug!(room = %self.room, agent = %agent, "responder had nothing to say");
            }
            Err(e) => {
                debug!(room = %self.room, agent = %agent, error = %e, "responder declined");
                self.push_log(ConversationEntry::Declined {
                    agent,
                    ts: Utc::now(),
                });
            }
        }
    }

    // -- bookkeeping --

    async fn handle_agent_detached(&mut self, agent: AgentId) {
        self.queue.retain(|(a, _)| *a != agent);
        if self.current.as_ref().is_some_and(|c| c.agent == agent) {
            self.force_stop(SpeakingEndReason::Cancelled).await;
        }
    }

    fn push_log(&mut self, entry: ConversationEntry) {
        self.log.push_back(entry);
        while self.log.len() > self.config.conversation_log_cap {
            self.log.pop_front();
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room: self.room.clone(),
            current_speaker: self.current.as_ref().map(|c| c.agent.clone()),
            speaking_since: self.current.as_ref().map(|c| c.started_at),
            queue: self.queue.iter().map(|(a, _)| a.clone()).collect(),
            log: self.log.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runtime double: speaks for a fixed duration (or until
    /// cancelled) and answers transcripts with a fixed reply.
    struct MockRuntime {
        statuses: Mutex<HashMap<AgentId, AgentStatus>>,
        stashes: Mutex<HashMap<AgentId, VecDeque<String>>>,
        speak_duration: Duration,
        speak_result: CoreResult<()>,
        respond_result: CoreResult<String>,
        spoken: Mutex<Vec<(AgentId, String)>>,
        stopped: Mutex<Vec<AgentId>>,
        turns: Mutex<Vec<AgentId>>,
    }

    impl MockRuntime {
        fn new(speak_duration: Duration) -> Self {
            Self {
                statuses: Mutex::new(HashMap::new()),
                stashes: Mutex::new(HashMap::new()),
                speak_duration,
                speak_result: Ok(()),
                respond_result: Ok("a reply".into()),
                spoken: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
                turns: Mutex::new(Vec::new()),
            }
        }

        fn add_listening(&self, id: &str) -> AgentId {
            let agent = AgentId::new(id);
            self.statuses
                .lock()
                .unwrap()
                .insert(agent.clone(), AgentStatus::Listening);
            agent
        }

        fn remove(&self, agent: &AgentId) {
            self.statuses.lock().unwrap().remove(agent);
        }
    }

    #[async_trait]
    impl VoiceRuntime for MockRuntime {
        async fn speak(
            &self,
            _room: &RoomId,
            agent: &AgentId,
            text: &str,
            mut cancel: watch::Receiver<bool>,
        ) -> CoreResult<()> {
            self.spoken
                .lock()
                .unwrap()
                .push((agent.clone(), text.to_string()));
            if self.speak_result.is_err() {
                return self.speak_result.clone();
            }
            tokio::select! {
                _ = tokio::time::sleep(self.speak_duration) => Ok(()),
                _ = cancel.wait_for(|&v| v) => Err(CoreError::Cancelled("stopped".into())),
            }
        }

        async fn stop_speaking(&self, _room: &RoomId, agent: &AgentId) {
            self.stopped.lock().unwrap().push(agent.clone());
        }

        async fn respond(
            &self,
            _agent: &AgentId,
            _transcript: &str,
            _origin: &str,
        ) -> CoreResult<String> {
            self.respond_result.clone()
        }

        async fn set_status(&self, agent: &AgentId, status: AgentStatus) {
            if let Some(entry) = self.statuses.lock().unwrap().get_mut(agent) {
                *entry = status;
            }
        }

        async fn status_of(&self, agent: &AgentId) -> Option<AgentStatus> {
            self.statuses.lock().unwrap().get(agent).copied()
        }

        async fn is_attached(&self, agent: &AgentId, _room: &RoomId) -> bool {
            self.statuses.lock().unwrap().contains_key(agent)
        }

        async fn listening_agents(&self, _room: &RoomId) -> Vec<AgentId> {
            let mut agents: Vec<AgentId> = self
                .statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, s)| s.is_eligible_responder())
                .map(|(a, _)| a.clone())
                .collect();
            agents.sort();
            agents
        }

        async fn queue_speech(&self, agent: &AgentId, text: &str) -> CoreResult<()> {
            let mut stashes = self.stashes.lock().unwrap();
            let stash = stashes.entry(agent.clone()).or_default();
            if stash.len() >= 8 {
                return Err(CoreError::Busy("speech queue full".into()));
            }
            stash.push_back(text.to_string());
            Ok(())
        }

        async fn pop_queued_speech(&self, agent: &AgentId) -> Option<String> {
            self.stashes.lock().unwrap().get_mut(agent)?.pop_front()
        }

        async fn count_voice_turn(&self, agent: &AgentId) {
            self.turns.lock().unwrap().push(agent.clone());
        }
    }

    fn config(limit_ms: u64) -> CoreConfig {
        CoreConfig {
            speaking_time_limit_ms: limit_ms,
            ..CoreConfig::default()
        }
    }

    fn spawn_arbiter(
        runtime: Arc<MockRuntime>,
        hub: &EventHub,
        limit_ms: u64,
    ) -> RoomArbiter {
        RoomArbiter::spawn(
            RoomId::new("r1"),
            runtime,
            hub.clone(),
            config(limit_ms),
            Arc::new(UniformRandomSelector),
        )
    }

    async fn next_matching(
        stream: &mut crate::events::EventStream,
        pred: impl Fn(&CoreEvent) -> bool,
    ) -> CoreEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = stream.next().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn sequential_speaks_do_not_interleave() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(20)));
        let a = runtime.add_listening("A");
        let b = runtime.add_listening("B");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter.request_speak(a.clone(), "Hello".into()).await.unwrap();
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == a && text == "Hello")
        })
        .await;
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, reason, .. }
                if *agent == a && *reason == SpeakingEndReason::Completed)
        })
        .await;

        arbiter.request_speak(b.clone(), "Hi".into()).await.unwrap();
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == b && text == "Hi")
        })
        .await;
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == b)
        })
        .await;

        assert_eq!(runtime.turns.lock().unwrap().len(), 2);
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn overlapping_speak_queues_fifo() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(50)));
        let a = runtime.add_listening("A");
        let b = runtime.add_listening("B");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter.request_speak(a.clone(), "one".into()).await.unwrap();
        arbiter.request_speak(b.clone(), "two".into()).await.unwrap();

        // B is queued while A speaks.
        let snap = arbiter.snapshot().await.unwrap();
        assert_eq!(snap.current_speaker, Some(a.clone()));
        assert_eq!(snap.queue, vec![b.clone()]);

        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == a)
        })
        .await;
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == b && text == "two")
        })
        .await;

        let snap = arbiter.snapshot().await.unwrap();
        assert!(snap.queue.is_empty());
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(10)));
        let a = runtime.add_listening("A");
        let arbiter = spawn_arbiter(runtime, &EventHub::new(), 30_000);

        let err = arbiter.request_speak(a, "   ".into()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn turn_queue_overflow_returns_busy() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_secs(60)));
        let hub = EventHub::new();
        let speaker = runtime.add_listening("speaker");
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 60_000);

        arbiter
            .request_speak(speaker, "holding the floor".into())
            .await
            .unwrap();

        // Fill the queue to its cap with distinct agents.
        for i in 0..16 {
            let agent = runtime.add_listening(&format!("q{i}"));
            arbiter
                .request_speak(agent, format!("queued {i}"))
                .await
                .unwrap();
        }
        let overflow = runtime.add_listening("overflow");
        let err = arbiter
            .request_speak(overflow, "one too many".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn forced_stop_at_time_limit() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_secs(60)));
        let a = runtime.add_listening("A");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 100);

        arbiter
            .request_speak(a.clone(), "a very long speech".into())
            .await
            .unwrap();
        let event = next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { .. })
        })
        .await;
        match event {
            CoreEvent::SpeakingEnd { agent, reason, .. } => {
                assert_eq!(agent, a);
                assert_eq!(reason, SpeakingEndReason::ForcedStop);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Producer was closed and the log records the forced stop.
        assert_eq!(runtime.stopped.lock().unwrap().as_slice(), &[a.clone()]);
        let snap = arbiter.snapshot().await.unwrap();
        assert!(snap
            .log
            .iter()
            .any(|e| matches!(e, ConversationEntry::ForcedStop { agent, .. } if *agent == a)));
        assert!(snap.current_speaker.is_none());
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_current_speaker() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_secs(60)));
        let a = runtime.add_listening("A");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 60_000);

        arbiter.request_speak(a.clone(), "long".into()).await.unwrap();
        arbiter.cancel_speak(a.clone()).await.unwrap();

        let event = next_matching(&mut stream, |e| matches!(e, CoreEvent::SpeakingEnd { .. })).await;
        match event {
            CoreEvent::SpeakingEnd { reason, .. } => {
                assert_eq!(reason, SpeakingEndReason::Cancelled)
            }
            other => panic!("unexpected event {other:?}"),
        }

        let err = arbiter.cancel_speak(a).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn detached_agent_dropped_from_queue_at_pop() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(50)));
        let a = runtime.add_listening("A");
        let b = runtime.add_listening("B");
        let c = runtime.add_listening("C");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter.request_speak(a.clone(), "one".into()).await.unwrap();
        arbiter.request_speak(b.clone(), "two".into()).await.unwrap();
        arbiter.request_speak(c.clone(), "three".into()).await.unwrap();

        // B leaves while queued.
        runtime.remove(&b);
        arbiter.agent_detached(b.clone()).await;

        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == a)
        })
        .await;
        // C starts; B never does.
        let event = next_matching(&mut stream, |e| matches!(e, CoreEvent::SpeakingStart { .. })).await;
        match event {
            CoreEvent::SpeakingStart { agent, .. } => assert_eq!(agent, c),
            other => panic!("unexpected event {other:?}"),
        }
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn transcript_triggers_selected_responder() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(20)));
        let a = runtime.add_listening("A");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter
            .ingest_transcript("r1-s1".into(), "hello agent".into(), 0.95)
            .await;

        let event = next_matching(&mut stream, |e| matches!(e, CoreEvent::SpeakingStart { .. })).await;
        match event {
            CoreEvent::SpeakingStart { agent, text, .. } => {
                assert_eq!(agent, a);
                assert_eq!(text, "a reply");
            }
            other => panic!("unexpected event {other:?}"),
        }
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn low_confidence_transcript_logged_but_never_triggers() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(20)));
        runtime.add_listening("A");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter
            .ingest_transcript("r1-s1".into(), "mumble".into(), 0.4)
            .await;

        // The transcription event fires, but no turn starts.
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::TranscriptionUpdate { confidence, .. } if *confidence == 0.4)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stream.try_next().is_none());

        let snap = arbiter.snapshot().await.unwrap();
        assert!(snap
            .log
            .iter()
            .any(|e| matches!(e, ConversationEntry::Transcript { text, .. } if text == "mumble")));
        assert!(snap.current_speaker.is_none());
        assert!(runtime.spoken.lock().unwrap().is_empty());
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn transcript_during_speech_is_logged_only() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_secs(60)));
        let a = runtime.add_listening("A");
        runtime.add_listening("B");
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &EventHub::new(), 60_000);

        arbiter.request_speak(a, "talking".into()).await.unwrap();
        arbiter
            .ingest_transcript("r1-s1".into(), "interruption".into(), 0.99)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the original utterance went out; no responder was engaged.
        assert_eq!(runtime.spoken.lock().unwrap().len(), 1);
        let snap = arbiter.snapshot().await.unwrap();
        assert!(snap
            .log
            .iter()
            .any(|e| matches!(e, ConversationEntry::Transcript { text, .. } if text == "interruption")));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn responder_failure_logged_as_declined() {
        let runtime = {
            let mut inner = MockRuntime::new(Duration::from_millis(10));
            inner.respond_result = Err(CoreError::ProviderError("llm down".into()));
            Arc::new(inner)
        };
        let a = runtime.add_listening("A");
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &EventHub::new(), 30_000);

        arbiter
            .ingest_transcript("r1-s1".into(), "hello".into(), 0.9)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = arbiter.snapshot().await.unwrap();
        assert!(snap
            .log
            .iter()
            .any(|e| matches!(e, ConversationEntry::Declined { agent, .. } if *agent == a)));
        assert!(snap.current_speaker.is_none());
        assert!(runtime.spoken.lock().unwrap().is_empty());
        assert_eq!(runtime.status_of(&a).await, Some(AgentStatus::Listening));
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn synthesis_failure_ends_turn_and_drains_queue() {
        let runtime = {
            let mut inner = MockRuntime::new(Duration::from_millis(10));
            inner.speak_result = Err(CoreError::ProviderError("tts down".into()));
            Arc::new(inner)
        };
        let a = runtime.add_listening("A");
        let b = runtime.add_listening("B");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter.request_speak(a.clone(), "one".into()).await.unwrap();
        arbiter.request_speak(b.clone(), "two".into()).await.unwrap();

        // A's turn closes with an error, then B gets its (also failing)
        // turn; no voice turns complete.
        let event = next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == a)
        })
        .await;
        match event {
            CoreEvent::SpeakingEnd { reason, .. } => {
                assert_eq!(reason, SpeakingEndReason::Error)
            }
            other => panic!("unexpected event {other:?}"),
        }
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == b)
        })
        .await;
        assert!(runtime.turns.lock().unwrap().is_empty());
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn repeat_request_stacks_on_agent_stash() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(40)));
        let a = runtime.add_listening("A");
        let hub = EventHub::new();
        let mut stream = hub.subscribe();
        let arbiter = spawn_arbiter(Arc::clone(&runtime), &hub, 30_000);

        arbiter.request_speak(a.clone(), "first".into()).await.unwrap();
        arbiter.request_speak(a.clone(), "second".into()).await.unwrap();

        // First plays out, then the stashed line follows.
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == a)
        })
        .await;
        next_matching(&mut stream, |e| {
            matches!(e, CoreEvent::SpeakingStart { text, .. } if text == "second")
        })
        .await;
        arbiter.shutdown().await;
    }

    #[tokio::test]
    async fn log_is_bounded() {
        let runtime = Arc::new(MockRuntime::new(Duration::from_millis(5)));
        let hub = EventHub::new();
        let mut config = config(30_000);
        config.conversation_log_cap = 10;
        let arbiter = RoomArbiter::spawn(
            RoomId::new("r1"),
            Arc::clone(&runtime) as Arc<dyn VoiceRuntime>,
            hub.clone(),
            config,
            Arc::new(UniformRandomSelector),
        );

        for i in 0..25 {
            arbiter
                .ingest_transcript("s".into(), format!("t{i}"), 0.1)
                .await;
        }
        let snap = arbiter.snapshot().await.unwrap();
        assert_eq!(snap.log.len(), 10);
        assert!(matches!(
            &snap.log[9],
            ConversationEntry::Transcript { text, .. } if text == "t24"
        ));
        arbiter.shutdown().await;
    }
}
