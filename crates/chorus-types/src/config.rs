//! Configuration structs with every tunable knob and its default.
//!
//! All knobs are named fields with serde defaults; no open-ended
//! dictionaries cross the core boundary. [`CoreConfig`] covers the
//! process-wide knobs; [`AgentConfig`] the per-agent provider settings.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

/// Process-wide configuration for the orchestrator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum agents in the process.
    pub max_agents: usize,
    /// Maximum agents attached to one room.
    pub max_agents_per_room: usize,
    /// Rolling history entries kept per agent.
    pub history_cap: usize,
    /// Pending speak requests per room.
    pub turn_queue_cap: usize,
    /// Pending speech items per agent.
    pub speech_queue_cap: usize,
    /// Upper bound on a single speaking turn, in milliseconds.
    pub speaking_time_limit_ms: u64,
    /// Minimum transcript confidence that may trigger a response.
    pub confidence_floor: f32,
    /// Minimum interval between LLM requests for one agent, in milliseconds.
    pub llm_min_interval_ms: u64,
    /// LLM request timeout, in milliseconds.
    pub llm_timeout_ms: u64,
    /// TTS request timeout, in milliseconds.
    pub tts_timeout_ms: u64,
    /// STT request timeout, in milliseconds.
    pub stt_timeout_ms: u64,
    /// Media RPC timeout, in milliseconds.
    pub media_timeout_ms: u64,
    /// Media reconnect attempts before the binding is torn down.
    pub media_reconnect_attempts: u32,
    /// Egress chunk size in bytes.
    pub egress_buffer_bytes: usize,
    /// Ingress VAD bucket duration, in milliseconds.
    pub ingress_bucket_ms: u64,
    /// RMS threshold for voice activity, as a fraction of 16-bit full scale.
    pub vad_rms_threshold: f32,
    /// Conversation log entries kept per room.
    pub conversation_log_cap: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            max_agents_per_room: 5,
            history_cap: 100,
            turn_queue_cap: 16,
            speech_queue_cap: 8,
            speaking_time_limit_ms: 30_000,
            confidence_floor: 0.7,
            llm_min_interval_ms: 2_000,
            llm_timeout_ms: 30_000,
            tts_timeout_ms: 15_000,
            stt_timeout_ms: 30_000,
            media_timeout_ms: 10_000,
            media_reconnect_attempts: 5,
            egress_buffer_bytes: 4096,
            ingress_bucket_ms: 1_000,
            vad_rms_threshold: 0.5,
            conversation_log_cap: 1_000,
        }
    }
}

impl CoreConfig {
    /// Validate that the configured bounds are usable.
    ///
    /// Zero caps would make every operation fail closed; a confidence
    /// floor outside [0, 1] would either drop everything or nothing.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_agents == 0 {
            return Err(CoreError::InvalidArgument("max_agents must be > 0".into()));
        }
        if self.max_agents_per_room == 0 {
            return Err(CoreError::InvalidArgument(
                "max_agents_per_room must be > 0".into(),
            ));
        }
        if self.history_cap == 0 {
            return Err(CoreError::InvalidArgument("history_cap must be > 0".into()));
        }
        if self.turn_queue_cap == 0 {
            return Err(CoreError::InvalidArgument(
                "turn_queue_cap must be > 0".into(),
            ));
        }
        if self.speech_queue_cap == 0 {
            return Err(CoreError::InvalidArgument(
                "speech_queue_cap must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(CoreError::InvalidArgument(format!(
                "confidence_floor must be within [0.0, 1.0], got {}",
                self.confidence_floor
            )));
        }
        if !(0.0..=1.0).contains(&self.vad_rms_threshold) {
            return Err(CoreError::InvalidArgument(format!(
                "vad_rms_threshold must be within [0.0, 1.0], got {}",
                self.vad_rms_threshold
            )));
        }
        if self.egress_buffer_bytes == 0 {
            return Err(CoreError::InvalidArgument(
                "egress_buffer_bytes must be > 0".into(),
            ));
        }
        if self.ingress_bucket_ms == 0 {
            return Err(CoreError::InvalidArgument(
                "ingress_bucket_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-agent provider settings
// ---------------------------------------------------------------------------

/// LLM settings for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmParams {
    /// Provider name (routing key for the adapter registry).
    pub provider: String,
    /// Model identifier sent to the provider.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum reply length in characters; longer replies are truncated.
    pub max_reply_chars: usize,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_reply_chars: 600,
        }
    }
}

/// Voice synthesis settings for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    /// TTS provider name.
    pub provider: String,
    /// Voice id (provider-specific).
    pub voice: String,
    /// Speaking rate multiplier.
    pub rate: f32,
    /// Pitch adjustment in semitones.
    pub pitch: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            voice: "alloy".to_string(),
            rate: 1.0,
            pitch: 0.0,
        }
    }
}

/// Full per-agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Language-model settings.
    pub llm: LlmParams,
    /// Voice synthesis settings.
    pub voice: VoiceParams,
}

// ---------------------------------------------------------------------------
// AttachOptions
// ---------------------------------------------------------------------------

/// Options for attaching an agent to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachOptions {
    /// Move the agent to `listening` immediately after the join completes,
    /// making it eligible as a transcript responder.
    pub start_listening: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            start_listening: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_agents, 10);
        assert_eq!(cfg.max_agents_per_room, 5);
        assert_eq!(cfg.history_cap, 100);
        assert_eq!(cfg.turn_queue_cap, 16);
        assert_eq!(cfg.speech_queue_cap, 8);
        assert_eq!(cfg.speaking_time_limit_ms, 30_000);
        assert_eq!(cfg.confidence_floor, 0.7);
        assert_eq!(cfg.llm_min_interval_ms, 2_000);
        assert_eq!(cfg.llm_timeout_ms, 30_000);
        assert_eq!(cfg.tts_timeout_ms, 15_000);
        assert_eq!(cfg.stt_timeout_ms, 30_000);
        assert_eq!(cfg.media_timeout_ms, 10_000);
        assert_eq!(cfg.media_reconnect_attempts, 5);
        assert_eq!(cfg.egress_buffer_bytes, 4096);
        assert_eq!(cfg.ingress_bucket_ms, 1_000);
        assert_eq!(cfg.vad_rms_threshold, 0.5);
        assert_eq!(cfg.conversation_log_cap, 1_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_caps() {
        let mut cfg = CoreConfig::default();
        cfg.max_agents = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CoreConfig::default();
        cfg.turn_queue_cap = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_floor() {
        let mut cfg = CoreConfig::default();
        cfg.confidence_floor = 1.5;
        assert!(cfg.validate().is_err());

        cfg.confidence_floor = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let json = r#"{"max_agents": 2, "speaking_time_limit_ms": 500}"#;
        let cfg: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_agents, 2);
        assert_eq!(cfg.speaking_time_limit_ms, 500);
        assert_eq!(cfg.history_cap, 100);
    }

    #[test]
    fn agent_config_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.voice.voice, "alloy");
        assert_eq!(cfg.voice.rate, 1.0);

        let back: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(back, cfg);
    }
}
