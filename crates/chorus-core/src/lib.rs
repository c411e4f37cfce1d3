//! The chorus orchestrator core.
//!
//! This crate wires the leaf layers into the system described by the
//! component table: agents (persona + rolling history + voice state),
//! the per-room arbiter (turn-taking, speaking time limit, transcript
//! triggering), and the agent manager (registry, caps, agent↔room
//! bindings, event fan-out, bus dispatch).
//!
//! # Concurrency model
//!
//! The manager and each room arbiter behave as serialized actors: the
//! manager serializes through one async mutex over its registry, and each
//! arbiter runs a single command loop. Long-running provider work (LLM,
//! TTS, media I/O) is launched as tasks whose completions come back as
//! commands, so no suspension ever holds a serialization point.

pub mod agent;
pub mod arbiter;
pub mod binding;
pub mod dispatch;
pub mod events;
pub mod manager;
pub mod runtime;

pub use agent::{Agent, AgentCell, AgentSnapshot};
pub use arbiter::{
    ConversationEntry, ResponderSelector, RoomArbiter, RoomSnapshot, UniformRandomSelector,
};
pub use binding::RoomBinding;
pub use dispatch::BusDispatcher;
pub use events::{EventHub, EventStream};
pub use manager::{AgentManager, CoreStats, MediaFactory, Providers, RoomView};
pub use runtime::VoiceRuntime;
