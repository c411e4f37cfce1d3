//! Text-to-speech adapter.
//!
//! [`TtsProvider`] is the synthesis seam; [`HttpTts`] implements it
//! against an OpenAI-style speech endpoint, and [`CachingTts`] decorates
//! any provider with an LRU of synthesized audio keyed by a hash of the
//! input, so repeated utterances (canned greetings, fallback lines) do not
//! hit the vendor twice.
//!
//! Text is sanitized before any provider call: control characters are
//! stripped and the length is capped. Logs record a text hash, never the
//! text itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use chorus_types::{AudioFormat, CoreError, CoreResult, VoiceParams};

use crate::{resolve_api_key, Availability, MaskedKey};

/// Maximum text length accepted for synthesis.
const MAX_TEXT_CHARS: usize = 4096;

/// Default LRU capacity for [`CachingTts`].
const DEFAULT_CACHE_CAP: usize = 128;

// ---------------------------------------------------------------------------
// TtsAudio
// ---------------------------------------------------------------------------

/// Synthesized audio with its format.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Strip control characters and enforce the length cap.
///
/// Returns `InvalidArgument` when the text is empty after sanitization or
/// exceeds the cap before it.
pub fn sanitize_text(text: &str) -> CoreResult<String> {
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(CoreError::InvalidArgument(format!(
            "text exceeds maximum length of {MAX_TEXT_CHARS} characters"
        )));
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidArgument(
            "text is empty after sanitization".into(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Hex sha-256 of synthesis inputs, for logs and cache keys.
fn input_hash(text: &str, voice: &VoiceParams) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(voice.provider.as_bytes());
    hasher.update([0]);
    hasher.update(voice.voice.as_bytes());
    hasher.update([0]);
    hasher.update(voice.rate.to_le_bytes());
    hasher.update(voice.pitch.to_le_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

fn short_hash(hash: &[u8; 32]) -> String {
    hash[..6].iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// TtsProvider trait
// ---------------------------------------------------------------------------

/// Trait seam for speech-synthesis backends.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize sanitized text with the given voice settings.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> CoreResult<TtsAudio>;

    /// Whether this provider knows the given voice id.
    fn supports_voice(&self, voice: &str) -> bool;

    /// Adapter readiness.
    fn availability(&self) -> Availability;

    /// Provider name.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HttpTts
// ---------------------------------------------------------------------------

/// Configuration for the HTTP TTS adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsProviderConfig {
    /// Speech endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model identifier.
    pub model: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "tts-1".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// Voice ids the speech endpoint accepts.
const KNOWN_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// OpenAI-style speech synthesis adapter. Output is mp3.
pub struct HttpTts {
    client: reqwest::Client,
    config: TtsProviderConfig,
    key: Option<MaskedKey>,
    availability: Availability,
}

impl std::fmt::Debug for HttpTts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTts")
            .field("base_url", &self.config.base_url)
            .field("key", &self.key)
            .field("availability", &self.availability)
            .finish_non_exhaustive()
    }
}

impl HttpTts {
    /// Build the adapter; degrades to unavailable on a missing key.
    pub fn new(config: TtsProviderConfig) -> Self {
        let (key, availability) = match resolve_api_key(&config.api_key_env) {
            Ok(key) => (Some(MaskedKey(key)), Availability::Ready),
            Err(unavailable) => (None, unavailable),
        };
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent("chorus/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            key,
            availability,
        }
    }
}

#[async_trait]
impl TtsProvider for HttpTts {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> CoreResult<TtsAudio> {
        self.availability.check()?;
        let sanitized = sanitize_text(text)?;
        if !self.supports_voice(&voice.voice) {
            return Err(CoreError::InvalidArgument(format!(
                "unsupported voice '{}' (known: {})",
                voice.voice,
                KNOWN_VOICES.join(", ")
            )));
        }

        let key = self
            .key
            .as_ref()
            .ok_or_else(|| CoreError::ProviderUnavailable("no API key".into()))?;

        let hash = input_hash(&sanitized, voice);
        debug!(
            voice = %voice.voice,
            text_hash = %short_hash(&hash),
            text_len = sanitized.len(),
            "tts request"
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "voice": voice.voice,
            "input": sanitized,
            "speed": voice.rate,
            "response_format": "mp3",
        });
        let response = self
            .client
            .post(format!("{}/audio/speech", self.config.base_url))
            .bearer_auth(&key.0)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::ProviderError(format!(
                        "tts request timed out after {} ms",
                        self.config.timeout_ms
                    ))
                } else {
                    CoreError::ProviderError(format!("tts request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CoreError::ProviderUnavailable(format!(
                "provider rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(CoreError::ProviderError(format!(
                "provider returned {status}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::ProviderError(format!("tts body read failed: {e}")))?
            .to_vec();

        info!(
            voice = %voice.voice,
            text_hash = %short_hash(&hash),
            audio_bytes = bytes.len(),
            "tts synthesized"
        );
        Ok(TtsAudio {
            bytes,
            format: AudioFormat::Mp3,
        })
    }

    fn supports_voice(&self, voice: &str) -> bool {
        KNOWN_VOICES.contains(&voice)
    }

    fn availability(&self) -> Availability {
        self.availability.clone()
    }

    fn name(&self) -> &str {
        "openai-speech"
    }
}

// ---------------------------------------------------------------------------
// CachingTts
// ---------------------------------------------------------------------------

struct CacheInner {
    entries: HashMap<[u8; 32], TtsAudio>,
    order: VecDeque<[u8; 32]>,
    hits: u64,
    misses: u64,
}

/// LRU decorator over any [`TtsProvider`].
pub struct CachingTts<P> {
    inner: P,
    cap: usize,
    cache: Mutex<CacheInner>,
}

impl<P: TtsProvider> CachingTts<P> {
    /// Wrap a provider with the default cache capacity.
    pub fn new(inner: P) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAP)
    }

    /// Wrap a provider with an explicit cache capacity.
    pub fn with_capacity(inner: P, cap: usize) -> Self {
        Self {
            inner,
            cap: cap.max(1),
            cache: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (u64, u64) {
        self.cache
            .lock()
            .map(|c| (c.hits, c.misses))
            .unwrap_or((0, 0))
    }

    fn lookup(&self, key: &[u8; 32]) -> Option<TtsAudio> {
        let Ok(mut cache) = self.cache.lock() else {
            return None;
        };
        if let Some(audio) = cache.entries.get(key).cloned() {
            cache.hits += 1;
            // Refresh recency.
            cache.order.retain(|k| k != key);
            cache.order.push_back(*key);
            Some(audio)
        } else {
            cache.misses += 1;
            None
        }
    }

    fn insert(&self, key: [u8; 32], audio: TtsAudio) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        while cache.order.len() >= self.cap {
            if let Some(evicted) = cache.order.pop_front() {
                cache.entries.remove(&evicted);
            } else {
                break;
            }
        }
        cache.order.push_back(key);
        cache.entries.insert(key, audio);
    }
}

#[async_trait]
impl<P: TtsProvider> TtsProvider for CachingTts<P> {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> CoreResult<TtsAudio> {
        let sanitized = sanitize_text(text)?;
        let key = input_hash(&sanitized, voice);
        if let Some(audio) = self.lookup(&key) {
            debug!(text_hash = %short_hash(&key), "tts cache hit");
            return Ok(audio);
        }
        let audio = self.inner.synthesize(&sanitized, voice).await?;
        self.insert(key, audio.clone());
        Ok(audio)
    }

    fn supports_voice(&self, voice: &str) -> bool {
        self.inner.supports_voice(voice)
    }

    fn availability(&self) -> Availability {
        self.inner.availability()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
