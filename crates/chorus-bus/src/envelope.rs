//! Typed JSON envelopes for the control topics.
//!
//! The bus carries opaque bytes; these are the shapes the core encodes and
//! decodes at its boundary. Unknown fields are rejected so that ill-formed
//! payloads surface as `InvalidArgument` instead of being silently
//! misread.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use chorus_types::{AgentConfig, AgentId, AttachOptions, RoomId};

use crate::BusError;

// ---------------------------------------------------------------------------
// Topic names
// ---------------------------------------------------------------------------

/// Control topics the core subscribes to.
pub mod topics {
    pub const AGENT_CREATE: &str = "agent.create";
    pub const AGENT_DELETE: &str = "agent.delete";
    pub const AGENT_JOIN_ROOM: &str = "agent.join-room";
    pub const AGENT_LEAVE_ROOM: &str = "agent.leave-room";
    pub const AGENT_SPEAK: &str = "agent.speak";
    pub const AGENT_STOP_SPEAK: &str = "agent.stop-speak";
    pub const TRANSCRIPTION_FINAL: &str = "transcription.final";

    /// All control topics, in subscription order.
    pub const ALL_CONTROL: &[&str] = &[
        AGENT_CREATE,
        AGENT_DELETE,
        AGENT_JOIN_ROOM,
        AGENT_LEAVE_ROOM,
        AGENT_SPEAK,
        AGENT_STOP_SPEAK,
        TRANSCRIPTION_FINAL,
    ];
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// `agent.create`: ask the manager to create an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateAgent {
    /// Persona text (the system directive).
    pub persona: String,
    /// Optional caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AgentId>,
    /// Optional provider configuration; defaults when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AgentConfig>,
}

/// `agent.delete`: ask the manager to destroy an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteAgent {
    pub id: AgentId,
}

/// `agent.join-room`: attach an agent to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinRoom {
    pub id: AgentId,
    pub room: RoomId,
    #[serde(default)]
    pub options: AttachOptions,
}

/// `agent.leave-room`: detach an agent from its room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaveRoom {
    pub id: AgentId,
}

/// `agent.speak`: request a speaking turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Speak {
    pub id: AgentId,
    pub text: String,
}

/// `agent.stop-speak`: cancel the current speaking turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopSpeak {
    pub id: AgentId,
}

/// `transcription.final`: a finalized transcript from an external STT feed.
///
/// The session id is prefixed with the room id (`<room>-s<n>` by
/// convention); [`TranscriptionFinal::room_id`] extracts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptionFinal {
    pub session: String,
    pub text: String,
    pub confidence: f32,
    pub ts: DateTime<Utc>,
}

impl TranscriptionFinal {
    /// The room id embedded in the session name, when present.
    pub fn room_id(&self) -> Option<RoomId> {
        self.session
            .rsplit_once("-s")
            .map(|(room, _)| RoomId::new(room))
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode an envelope to its JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(value).map_err(|e| BusError::Decode(e.to_string()))
}

/// Decode JSON bytes into a typed envelope.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    serde_json::from_slice(payload).map_err(|e| BusError::Decode(e.to_string()))
}
