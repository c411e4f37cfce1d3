//! Shared types for the chorus voice-agent orchestrator.
//!
//! Every other chorus crate depends on this one. It defines:
//!
//! - Strongly-typed identifiers ([`AgentId`], [`RoomId`])
//! - The message and agent data model ([`Message`], [`AgentStatus`], [`AgentMetrics`])
//! - The observer event vocabulary ([`CoreEvent`])
//! - Configuration structs with every tunable knob ([`CoreConfig`], [`AgentConfig`])
//! - The error taxonomy ([`CoreError`], [`ErrorKind`])
//!
//! Nothing in this crate performs I/O; it is pure data.

pub mod audio;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod message;

pub use audio::AudioFormat;
pub use config::{AgentConfig, AttachOptions, CoreConfig, LlmParams, VoiceParams};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use event::{CoreEvent, SpeakingEndReason};
pub use ids::{AgentId, RoomId};
pub use message::{AgentMetrics, AgentStatus, Message, MessageKind, MessageTarget};
