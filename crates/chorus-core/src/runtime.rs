//! The seam between the room arbiter and the rest of the core.
//!
//! The arbiter owns turn ordering and timing but not the machinery of a
//! turn: synthesis, media production, prompt building. Those live behind
//! [`VoiceRuntime`], which the agent manager implements over its registry
//! and bindings, and which tests replace with scripted doubles.

use async_trait::async_trait;
use tokio::sync::watch;

use chorus_types::{AgentId, AgentStatus, CoreResult, RoomId};

/// Operations the arbiter delegates out of its serialization point.
///
/// All of these may suspend; the arbiter invokes them from spawned tasks
/// (never inline in its command loop) except for the quick status and
/// queue bookkeeping calls.
#[async_trait]
pub trait VoiceRuntime: Send + Sync {
    /// Synthesize `text` as `agent` and stream it into `room` until the
    /// audio has fully played out or `cancel` flips to true.
    ///
    /// Errors follow the provider taxonomy: `ProviderError` for TTS
    /// failures, `TransportUnavailable`/`MediaUnrecoverable` for producer
    /// failures mid-speech.
    async fn speak(
        &self,
        room: &RoomId,
        agent: &AgentId,
        text: &str,
        cancel: watch::Receiver<bool>,
    ) -> CoreResult<()>;

    /// Immediately close the agent's open producer (force-stop path).
    async fn stop_speaking(&self, room: &RoomId, agent: &AgentId);

    /// Produce the agent's text reply to a transcript (LLM path). The
    /// returned text may be empty, meaning the agent has nothing to say.
    async fn respond(&self, agent: &AgentId, transcript: &str, origin: &str)
        -> CoreResult<String>;

    /// Set an agent's status, emitting the status event.
    async fn set_status(&self, agent: &AgentId, status: AgentStatus);

    /// Current status, or `None` when the agent no longer exists.
    async fn status_of(&self, agent: &AgentId) -> Option<AgentStatus>;

    /// Whether the agent is still attached to `room`.
    async fn is_attached(&self, agent: &AgentId, room: &RoomId) -> bool;

    /// Agents attached to `room` whose status makes them eligible
    /// responders.
    async fn listening_agents(&self, room: &RoomId) -> Vec<AgentId>;

    /// Stash an utterance on the agent's own bounded speech queue.
    async fn queue_speech(&self, agent: &AgentId, text: &str) -> CoreResult<()>;

    /// Pop the agent's next stashed utterance.
    async fn pop_queued_speech(&self, agent: &AgentId) -> Option<String>;

    /// Record a completed voice turn on the agent's metrics.
    async fn count_voice_turn(&self, agent: &AgentId);
}
