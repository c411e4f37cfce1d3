//! The chorus daemon: wires providers, bus, and media into the core and
//! runs until interrupted.
//!
//! Usage: `chorus-daemon [config.toml]`
//!
//! Providers are constructed once at startup; an adapter missing its
//! credentials comes up unavailable and reports so per call, without
//! blocking the rest of the process.

mod config;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chorus_audio::{FfmpegTranscoder, Transcoder};
use chorus_bus::{Bus, MemoryBus, WsBus, WsBusConfig};
use chorus_core::{AgentManager, BusDispatcher, MediaFactory, Providers};
use chorus_media::{MediaTransport, WsMediaTransport, WsMediaTransportConfig};
use chorus_providers::{
    CachingTts, HttpLlm, HttpStt, HttpTts, LlmProvider, SttProvider, TtsProvider, WsStt,
};
use chorus_types::{CoreError, CoreResult};

use crate::config::DaemonConfig;

/// Dials one media connection per binding.
struct WsMediaFactory {
    url: String,
    timeout_ms: u64,
}

#[async_trait]
impl MediaFactory for WsMediaFactory {
    async fn transport(&self) -> CoreResult<Arc<dyn MediaTransport>> {
        if self.url.is_empty() {
            return Err(CoreError::ProviderUnavailable(
                "no media server configured".into(),
            ));
        }
        let mut config = WsMediaTransportConfig::new(self.url.clone());
        config.timeout = std::time::Duration::from_millis(self.timeout_ms);
        let transport = WsMediaTransport::new(config);
        transport.connect().await?;
        Ok(Arc::new(transport))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = DaemonConfig::load(config_path.as_deref()).context("loading configuration")?;
    info!(
        bus = %if config.bus_url.is_empty() { "<in-process>" } else { &config.bus_url },
        media = %config.media_url,
        "chorus daemon starting"
    );

    // Provider singletons, created up front. Unavailable ones log and
    // degrade instead of stopping the process. The core knobs are
    // authoritative for the shared limits.
    let mut llm_config = config.llm.clone();
    llm_config.timeout_ms = config.core.llm_timeout_ms;
    llm_config.min_interval_ms = config.core.llm_min_interval_ms;
    let mut tts_config = config.tts.clone();
    tts_config.timeout_ms = config.core.tts_timeout_ms;
    let mut stt_config = config.stt.clone();
    stt_config.timeout_ms = config.core.stt_timeout_ms;
    stt_config.confidence_floor = config.core.confidence_floor;

    let llm: Arc<dyn LlmProvider> = Arc::new(HttpLlm::new(llm_config));
    let tts: Arc<dyn TtsProvider> = Arc::new(CachingTts::new(HttpTts::new(tts_config)));
    let stt: Arc<dyn SttProvider> = if stt_config.stream_url.is_empty() {
        Arc::new(HttpStt::new(stt_config.clone()))
    } else {
        Arc::new(WsStt::new(stt_config))
    };
    for (name, ready) in [
        ("llm", llm.availability().is_ready()),
        ("tts", tts.availability().is_ready()),
        ("stt", stt.availability().is_ready()),
    ] {
        if ready {
            info!(provider = name, "provider ready");
        } else {
            warn!(provider = name, "provider unavailable, calls will be rejected");
        }
    }

    let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new());
    if !transcoder.is_available() {
        warn!("ffmpeg not found; audio pipelines cannot convert formats");
    }

    let media = Arc::new(WsMediaFactory {
        url: config.media_url.clone(),
        timeout_ms: config.core.media_timeout_ms,
    });

    let manager = AgentManager::new(
        config.core.clone(),
        Providers { llm, tts, stt },
        transcoder,
        media,
    )
    .map_err(|e| anyhow::anyhow!("building manager: {e}"))?;

    // Bus: external broker when configured, in-process fan-out otherwise.
    let bus: Arc<dyn Bus> = if config.bus_url.is_empty() {
        Arc::new(MemoryBus::new())
    } else {
        Arc::new(WsBus::new(WsBusConfig::new(config.bus_url.clone())))
    };
    bus.connect()
        .await
        .map_err(|e| anyhow::anyhow!("connecting bus: {e}"))?;

    let mut dispatcher = BusDispatcher::start(Arc::clone(&bus), manager.clone())
        .await
        .map_err(|e| anyhow::anyhow!("starting dispatcher: {e}"))?;
    info!("chorus daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    dispatcher.stop();
    manager.shutdown().await;
    bus.disconnect().await;
    info!("chorus daemon stopped");
    Ok(())
}
