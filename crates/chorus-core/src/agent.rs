//! The agent: persona, rolling history, status, and per-agent voice state.
//!
//! [`Agent`] is the plain record; [`AgentCell`] is the shared handle the
//! manager and arbiter go through. One async mutex per agent realizes the
//! "at most one operation mutates a given agent's record" contract, and
//! every status change is emitted through the event hub after it lands.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use chorus_providers::{ChatTurn, LlmProvider, LlmReply};
use chorus_types::{
    AgentConfig, AgentId, AgentMetrics, AgentStatus, CoreError, CoreEvent, CoreResult, Message,
    MessageKind, MessageTarget, RoomId,
};

use crate::events::EventHub;

/// Fixed reply used when the language model fails mid-exchange.
pub const FALLBACK_REPLY: &str = "I'm sorry, I'm having trouble putting that into words right now.";

/// History entries considered when building an LLM prompt.
const PROMPT_HISTORY_TURNS: usize = 10;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One persona-bound participant.
pub struct Agent {
    id: AgentId,
    persona: String,
    config: AgentConfig,
    status: AgentStatus,
    history: VecDeque<Message>,
    history_cap: usize,
    speech_queue: VecDeque<String>,
    speech_queue_cap: usize,
    room: Option<RoomId>,
    last_activity: DateTime<Utc>,
    metrics: AgentMetrics,
}

/// Read-only view of an agent for API callers.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub persona: String,
    pub status: AgentStatus,
    pub room: Option<RoomId>,
    pub history_len: usize,
    pub queued_speech: usize,
    pub last_activity: DateTime<Utc>,
    pub metrics: AgentMetrics,
    pub config: AgentConfig,
}

impl Agent {
    /// Create an agent record.
    pub fn new(
        id: AgentId,
        persona: String,
        config: AgentConfig,
        history_cap: usize,
        speech_queue_cap: usize,
    ) -> Self {
        Self {
            id,
            persona,
            config,
            status: AgentStatus::Idle,
            history: VecDeque::new(),
            history_cap,
            speech_queue: VecDeque::new(),
            speech_queue_cap,
            room: None,
            last_activity: Utc::now(),
            metrics: AgentMetrics::default(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics
    }

    /// Set the room binding marker (the manager keeps the inverse map).
    pub fn set_room(&mut self, room: Option<RoomId>) {
        self.room = room;
    }

    /// Change status; returns `(from, to)` when it actually changed.
    pub fn set_status(&mut self, status: AgentStatus) -> Option<(AgentStatus, AgentStatus)> {
        if self.status == status {
            return None;
        }
        let from = self.status;
        self.status = status;
        self.last_activity = Utc::now();
        Some((from, status))
    }

    /// Append a message to history, trimming FIFO at the cap.
    pub fn append_history(&mut self, message: Message) {
        self.history.push_back(message);
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
        self.metrics.messages += 1;
        self.last_activity = Utc::now();
    }

    /// Replace configuration. History is never touched.
    pub fn update_config(&mut self, config: AgentConfig) {
        self.config = config;
        self.last_activity = Utc::now();
    }

    /// Queue a pending utterance; `Busy` when the queue is full.
    pub fn queue_speech(&mut self, text: String) -> CoreResult<()> {
        if self.speech_queue.len() >= self.speech_queue_cap {
            return Err(CoreError::Busy(format!(
                "speech queue for agent {} is full ({} pending)",
                self.id,
                self.speech_queue.len()
            )));
        }
        self.speech_queue.push_back(text);
        Ok(())
    }

    /// Pop the next pending utterance.
    pub fn pop_speech(&mut self) -> Option<String> {
        self.speech_queue.pop_front()
    }

    /// Count voice-turn completions.
    pub fn count_voice_turn(&mut self) {
        self.metrics.voice_turns += 1;
    }

    /// Count an LLM invocation.
    pub fn count_llm_call(&mut self) {
        self.metrics.llm_calls += 1;
    }

    /// Count a TTS invocation.
    pub fn count_tts_call(&mut self) {
        self.metrics.tts_calls += 1;
    }

    /// Build attributed chat turns from the last ten text exchanges.
    ///
    /// Outbound entries become assistant turns; everything else is a user
    /// turn attributed by origin id.
    pub fn chat_turns(&self) -> Vec<ChatTurn> {
        self.history
            .iter()
            .filter(|m| m.kind.is_text_exchange())
            .rev()
            .take(PROMPT_HISTORY_TURNS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|m| {
                if m.kind == MessageKind::OutboundText {
                    ChatTurn::assistant(self.id.as_str(), m.content.clone())
                } else {
                    ChatTurn::user(m.from.clone(), m.content.clone())
                }
            })
            .collect()
    }

    /// Snapshot for API callers.
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            persona: self.persona.clone(),
            status: self.status,
            room: self.room.clone(),
            history_len: self.history.len(),
            queued_speech: self.speech_queue.len(),
            last_activity: self.last_activity,
            metrics: self.metrics,
            config: self.config.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &VecDeque<Message> {
        &self.history
    }
}

// ---------------------------------------------------------------------------
// AgentCell
// ---------------------------------------------------------------------------

/// Shared handle to one agent record.
#[derive(Clone)]
pub struct AgentCell {
    id: AgentId,
    inner: Arc<Mutex<Agent>>,
    events: EventHub,
}

impl AgentCell {
    /// Wrap an agent record.
    pub fn new(agent: Agent, events: EventHub) -> Self {
        Self {
            id: agent.id().clone(),
            inner: Arc::new(Mutex::new(agent)),
            events,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Run a closure against the locked record.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Agent) -> R) -> R {
        let mut agent = self.inner.lock().await;
        f(&mut agent)
    }

    /// Current status.
    pub async fn status(&self) -> AgentStatus {
        self.inner.lock().await.status()
    }

    /// Set status and emit `agent.status-changed` if it changed.
    pub async fn set_status(&self, status: AgentStatus) {
        let change = {
            let mut agent = self.inner.lock().await;
            agent.set_status(status)
        };
        if let Some((from, to)) = change {
            self.events.emit(CoreEvent::AgentStatusChanged {
                agent: self.id.clone(),
                from,
                to,
                ts: Utc::now(),
            });
        }
    }

    /// Snapshot for API callers.
    pub async fn snapshot(&self) -> AgentSnapshot {
        self.inner.lock().await.snapshot()
    }

    /// Append a message, emitting `conversation.message`.
    pub async fn record_message(&self, message: Message) {
        {
            let mut agent = self.inner.lock().await;
            agent.append_history(message.clone());
        }
        self.events.emit(CoreEvent::ConversationMessage {
            agent: self.id.clone(),
            message,
            ts: Utc::now(),
        });
    }

    /// The agent's direct text exchange: append the inbound message, ask
    /// the model, append the reply, and return it.
    ///
    /// On model failure the fixed fallback reply is returned and the
    /// status still lands back on the caller-provided `rest` status.
    pub async fn process_text(
        &self,
        llm: &Arc<dyn LlmProvider>,
        inbound: Message,
        rest: AgentStatus,
    ) -> CoreResult<Message> {
        let (persona, turns, params) = {
            let mut agent = self.inner.lock().await;
            agent.set_status(AgentStatus::Processing);
            agent.append_history(inbound.clone());
            agent.count_llm_call();
            (
                agent.persona().to_string(),
                agent.chat_turns(),
                agent.config().llm.clone(),
            )
        };
        self.events.emit(CoreEvent::ConversationMessage {
            agent: self.id.clone(),
            message: inbound.clone(),
            ts: Utc::now(),
        });

        let started = std::time::Instant::now();
        let generated = llm
            .generate(self.id.as_str(), &persona, &turns, &params)
            .await;

        let (reply_text, model_tag) = match generated {
            Ok(LlmReply {
                text, model_tag, ..
            }) if !text.trim().is_empty() => (text, Some(model_tag)),
            Ok(_) => {
                debug!(agent = %self.id, "model returned an empty reply, using fallback");
                (FALLBACK_REPLY.to_string(), None)
            }
            Err(e) => {
                debug!(agent = %self.id, error = %e, "model failed, using fallback");
                (FALLBACK_REPLY.to_string(), None)
            }
        };

        let mut reply = Message::new(
            MessageKind::OutboundText,
            reply_text,
            self.id.as_str(),
            MessageTarget::Agent(AgentId::new(inbound.from.clone())),
        )
        .with_latency_ms(started.elapsed().as_millis() as u64);
        if let Some(tag) = model_tag {
            reply = reply.with_model_tag(tag);
        }

        {
            let mut agent = self.inner.lock().await;
            agent.append_history(reply.clone());
            agent.set_status(rest);
        }
        self.events.emit(CoreEvent::ConversationMessage {
            agent: self.id.clone(),
            message: reply.clone(),
            ts: Utc::now(),
        });
        Ok(reply)
    }
}
