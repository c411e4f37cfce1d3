//! Observer events emitted by the agent manager.
//!
//! Events describe state changes after they are committed to the core's
//! data model. They fan out to in-process observers through the manager's
//! event hub and, via the bus dispatcher, to external subscribers on the
//! matching bus topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::ids::{AgentId, RoomId};
use crate::message::{AgentStatus, Message};

/// Why a speaking turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakingEndReason {
    /// The utterance played out fully.
    Completed,
    /// An explicit stop request interrupted the turn.
    Cancelled,
    /// The speaking time limit expired and the arbiter force-stopped.
    ForcedStop,
    /// A provider or media failure ended the turn early.
    Error,
}

/// Lifecycle and status events emitted to observers.
///
/// Every variant carries the identity of the affected entity and a `ts`
/// stamped when the underlying state change was committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// An agent was created.
    AgentCreated { agent: AgentId, ts: DateTime<Utc> },
    /// An agent was destroyed.
    AgentDeleted { agent: AgentId, ts: DateTime<Utc> },
    /// An agent's status changed.
    AgentStatusChanged {
        agent: AgentId,
        from: AgentStatus,
        to: AgentStatus,
        ts: DateTime<Utc>,
    },
    /// An agent's configuration was replaced.
    AgentUpdated { agent: AgentId, ts: DateTime<Utc> },
    /// An agent started a speaking turn.
    SpeakingStart {
        agent: AgentId,
        room: RoomId,
        text: String,
        ts: DateTime<Utc>,
    },
    /// An agent's speaking turn ended.
    SpeakingEnd {
        agent: AgentId,
        room: RoomId,
        reason: SpeakingEndReason,
        ts: DateTime<Utc>,
    },
    /// An agent joined a room.
    RoomJoined {
        agent: AgentId,
        room: RoomId,
        ts: DateTime<Utc>,
    },
    /// An agent left a room.
    RoomLeft {
        agent: AgentId,
        room: RoomId,
        /// Set when the detach was forced by a media failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
        ts: DateTime<Utc>,
    },
    /// A message was appended to an agent's conversation.
    ConversationMessage {
        agent: AgentId,
        message: Message,
        ts: DateTime<Utc>,
    },
    /// A transcription was observed in a room.
    TranscriptionUpdate {
        room: RoomId,
        session: String,
        text: String,
        confidence: f32,
        ts: DateTime<Utc>,
    },
}

impl CoreEvent {
    /// The bus topic this event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            CoreEvent::AgentCreated { .. } => "agent.created",
            CoreEvent::AgentDeleted { .. } => "agent.deleted",
            CoreEvent::AgentStatusChanged { .. } => "agent.status-changed",
            CoreEvent::AgentUpdated { .. } => "agent.updated",
            CoreEvent::SpeakingStart { .. } => "agent.speaking.start",
            CoreEvent::SpeakingEnd { .. } => "agent.speaking.end",
            CoreEvent::RoomJoined { .. } => "room.joined",
            CoreEvent::RoomLeft { .. } => "room.left",
            CoreEvent::ConversationMessage { .. } => "conversation.message",
            CoreEvent::TranscriptionUpdate { .. } => "transcription.update",
        }
    }

    /// The event timestamp.
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            CoreEvent::AgentCreated { ts, .. }
            | CoreEvent::AgentDeleted { ts, .. }
            | CoreEvent::AgentStatusChanged { ts, .. }
            | CoreEvent::AgentUpdated { ts, .. }
            | CoreEvent::SpeakingStart { ts, .. }
            | CoreEvent::SpeakingEnd { ts, .. }
            | CoreEvent::RoomJoined { ts, .. }
            | CoreEvent::RoomLeft { ts, .. }
            | CoreEvent::ConversationMessage { ts, .. }
            | CoreEvent::TranscriptionUpdate { ts, .. } => *ts,
        }
    }
}
