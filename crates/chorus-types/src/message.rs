//! The message and agent data model.
//!
//! A [`Message`] is one entry in an agent's rolling history: a text or
//! voice exchange, or a system note. [`AgentStatus`] is the per-agent
//! voice state consulted by the room arbiter, and [`AgentMetrics`] the
//! per-agent activity counters surfaced by `stats()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::AgentId;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Text received from an external party or another agent.
    InboundText,
    /// Text produced by the agent itself.
    OutboundText,
    /// A finalized voice transcript heard in a room.
    InboundVoice,
    /// An utterance the agent spoke into a room.
    OutboundVoice,
    /// Internal bookkeeping note (fallbacks, forced stops).
    System,
}

impl MessageKind {
    /// Whether this kind participates in LLM prompt building.
    ///
    /// Prompts are built from text exchanges only; voice entries are
    /// already mirrored as text by the transcription path and system
    /// notes never reach the model.
    pub fn is_text_exchange(self) -> bool {
        matches!(self, MessageKind::InboundText | MessageKind::OutboundText)
    }
}

// ---------------------------------------------------------------------------
// MessageTarget
// ---------------------------------------------------------------------------

/// Destination of a message: a specific agent or every listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    /// A single agent.
    Agent(AgentId),
    /// All attached listeners.
    Broadcast,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One entry in an agent's rolling history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// What kind of exchange this was.
    pub kind: MessageKind,
    /// UTF-8 content.
    pub content: String,
    /// Origin id (agent id, or an external session id).
    pub from: String,
    /// Destination.
    pub to: MessageTarget,
    /// When the message was recorded.
    pub ts: DateTime<Utc>,
    /// Transcript confidence, for voice entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// End-to-end response latency, for outbound replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Provider/model tag that produced the content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_tag: Option<String>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(
        kind: MessageKind,
        content: impl Into<String>,
        from: impl Into<String>,
        to: MessageTarget,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content: content.into(),
            from: from.into(),
            to,
            ts: Utc::now(),
            confidence: None,
            latency_ms: None,
            model_tag: None,
        }
    }

    /// Attach a transcript confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach a response latency.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Attach the provider/model tag that produced this content.
    pub fn with_model_tag(mut self, tag: impl Into<String>) -> Self {
        self.model_tag = Some(tag.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// Per-agent voice state.
///
/// Transitions are driven by the agent's own processing paths and the
/// room arbiter; no other component writes status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Not attached to a room, or attached and idle.
    #[default]
    Idle,
    /// Attached to a room and eligible to be picked as a responder.
    Listening,
    /// Waiting on an LLM reply for a voice turn.
    Thinking,
    /// Currently holding the speaking turn in its room.
    Speaking,
    /// Handling a direct text exchange.
    Processing,
}

impl AgentStatus {
    /// Whether the arbiter may select this agent as a transcript responder.
    pub fn is_eligible_responder(self) -> bool {
        self == AgentStatus::Listening
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Listening => "listening",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Speaking => "speaking",
            AgentStatus::Processing => "processing",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// AgentMetrics
// ---------------------------------------------------------------------------

/// Per-agent activity counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// History entries appended.
    pub messages: u64,
    /// LLM invocations attempted.
    pub llm_calls: u64,
    /// TTS invocations attempted.
    pub tts_calls: u64,
    /// Completed voice turns (speak start through speak end).
    pub voice_turns: u64,
}
