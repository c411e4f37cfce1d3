//! Daemon configuration: TOML file with `CHORUS_*` environment overrides.
//!
//! Priority chain (later overrides earlier):
//!
//! 1. Built-in defaults
//! 2. The TOML file passed on the command line (optional)
//! 3. `CHORUS_BUS_URL` / `CHORUS_MEDIA_URL` environment variables

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chorus_providers::{LlmProviderConfig, SttProviderConfig, TtsProviderConfig};
use chorus_types::CoreConfig;

/// Maximum config file size. Larger files are rejected.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Full daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// WebSocket bus broker URL. Empty means in-process bus only.
    pub bus_url: String,
    /// Media server URL. Required to attach agents to rooms.
    pub media_url: String,
    /// Core orchestrator knobs.
    pub core: CoreConfig,
    /// LLM adapter settings.
    pub llm: LlmProviderConfig,
    /// TTS adapter settings.
    pub tts: TtsProviderConfig,
    /// STT adapter settings.
    pub stt: SttProviderConfig,
}

impl DaemonConfig {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let meta = std::fs::metadata(path)
                    .with_context(|| format!("config file {}", path.display()))?;
                if meta.len() > MAX_CONFIG_FILE_SIZE {
                    anyhow::bail!(
                        "config file {} exceeds {} bytes",
                        path.display(),
                        MAX_CONFIG_FILE_SIZE
                    );
                }
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid core config: {e}"))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CHORUS_BUS_URL") {
            if !url.is_empty() {
                self.bus_url = url;
            }
        }
        if let Ok(url) = std::env::var("CHORUS_MEDIA_URL") {
            if !url.is_empty() {
                self.media_url = url;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.core.validate().is_ok());
        assert!(config.bus_url.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let text = r#"
            media_url = "ws://127.0.0.1:4443/rtc"

            [core]
            max_agents = 3

            [tts]
            model = "tts-1-hd"
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.media_url, "ws://127.0.0.1:4443/rtc");
        assert_eq!(config.core.max_agents, 3);
        assert_eq!(config.core.max_agents_per_room, 5);
        assert_eq!(config.tts.model, "tts-1-hd");
        assert_eq!(config.llm.timeout_ms, 30_000);
    }

    #[test]
    fn unknown_fields_are_tolerated_in_file() {
        // Config files evolve; an old daemon reading a newer file should
        // not fall over.
        let text = r#"
            some_future_knob = true
        "#;
        let config: Result<DaemonConfig, _> = toml::from_str(text);
        assert!(config.is_ok());
    }
}
