//! Speech-to-text adapter.
//!
//! [`SttProvider`] offers two modes: batch [`SttProvider::transcribe`] and
//! a streaming session ([`SttProvider::open_stream`]) that accepts audio
//! chunks and emits interim/final [`SttEvent`]s.
//!
//! The confidence floor is applied inside the adapter: results below it
//! are dropped, never surfaced. Batch callers see `Ok(None)`; streaming
//! callers simply never receive the event.
//!
//! Implementations:
//!
//! - [`HttpStt`]: batch multipart upload to a Whisper-style endpoint.
//!   Streaming sessions buffer chunks and run one batch transcription when
//!   the audio sink closes.
//! - [`WsStt`]: true streaming over a WebSocket endpoint that pushes
//!   interim and final results as JSON.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use chorus_types::{CoreError, CoreResult};

use crate::{resolve_api_key, Availability, MaskedKey};

/// Capacity of a streaming session's audio chunk queue.
const AUDIO_QUEUE_CAP: usize = 32;

/// Capacity of a streaming session's event queue.
const EVENT_QUEUE_CAP: usize = 32;

/// Maximum batch audio size accepted (25 MB).
const MAX_BATCH_AUDIO_BYTES: usize = 25 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A batch transcription result.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// One streaming transcription event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttEvent {
    pub text: String,
    pub confidence: f32,
    /// Interim results refine until a final arrives.
    #[serde(default)]
    pub is_final: bool,
}

// ---------------------------------------------------------------------------
// SttStream
// ---------------------------------------------------------------------------

/// A live streaming transcription session.
///
/// Audio chunks go in through [`SttStream::push_audio`]; events come out of
/// [`SttStream::next_event`]. Closing the sink (via [`SttStream::close`] or
/// by dropping) finalizes the session.
pub struct SttStream {
    session: String,
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
    events_rx: mpsc::Receiver<SttEvent>,
    task: JoinHandle<()>,
}

impl SttStream {
    /// Assemble a stream from its channels and worker task. Custom
    /// [`SttProvider`] implementations (including test doubles) build
    /// their sessions through this.
    pub fn from_parts(
        session: &str,
        audio_tx: mpsc::Sender<Vec<u8>>,
        events_rx: mpsc::Receiver<SttEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            session: session.to_string(),
            audio_tx: Some(audio_tx),
            events_rx,
            task,
        }
    }

    /// The session id this stream was opened with.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// A clone of the audio sink, for feeding from a separate task.
    /// `None` once the sink has been closed.
    pub fn sink(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.audio_tx.clone()
    }

    /// Feed one audio chunk into the session.
    pub async fn push_audio(&self, chunk: Vec<u8>) -> CoreResult<()> {
        let Some(tx) = self.audio_tx.as_ref() else {
            return Err(CoreError::Cancelled("stt session is closed".into()));
        };
        tx.send(chunk)
            .await
            .map_err(|_| CoreError::ProviderError("stt session worker is gone".into()))
    }

    /// Receive the next event, or `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<SttEvent> {
        self.events_rx.recv().await
    }

    /// Close the audio sink and let the session finalize. Remaining events
    /// can still be drained with [`SttStream::next_event`].
    pub fn close_sink(&mut self) {
        self.audio_tx = None;
    }

    /// Close the session entirely, discarding pending events.
    pub async fn close(mut self) {
        self.audio_tx = None;
        self.events_rx.close();
        // Give the worker a moment to finish; abort if it does not.
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
        self.task.abort();
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// SttProvider trait
// ---------------------------------------------------------------------------

/// Trait seam for speech-to-text backends.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Batch-transcribe a complete audio buffer.
    ///
    /// Returns `Ok(None)` when the result falls below the confidence floor.
    async fn transcribe(&self, audio: &[u8], lang: &str) -> CoreResult<Option<Transcript>>;

    /// Open a streaming session.
    async fn open_stream(&self, session: &str, lang: &str) -> CoreResult<SttStream>;

    /// Adapter readiness.
    fn availability(&self) -> Availability;

    /// Provider name.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for STT adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttProviderConfig {
    /// Batch endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Streaming WebSocket URL (for [`WsStt`]).
    pub stream_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model identifier.
    pub model: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Results below this confidence are dropped.
    pub confidence_floor: f32,
}

impl Default for SttProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            stream_url: String::new(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "whisper-1".to_string(),
            timeout_ms: 30_000,
            confidence_floor: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// HttpStt
// ---------------------------------------------------------------------------

struct HttpSttInner {
    client: reqwest::Client,
    config: SttProviderConfig,
    key: Option<MaskedKey>,
    availability: Availability,
}

/// Whisper-style batch transcription adapter.
#[derive(Clone)]
pub struct HttpStt {
    inner: Arc<HttpSttInner>,
}

impl std::fmt::Debug for HttpStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStt")
            .field("base_url", &self.inner.config.base_url)
            .field("key", &self.inner.key)
            .field("availability", &self.inner.availability)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct WireTranscription {
    text: String,
    /// Whisper-style endpoints do not report confidence; treat absent as 1.0.
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl HttpStt {
    /// Build the adapter; degrades to unavailable on a missing key.
    pub fn new(config: SttProviderConfig) -> Self {
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
            inner: Arc::new(HttpSttInner {
                client,
                config,
                key,
                availability,
            }),
        }
    }
}

#[async_trait]
impl SttProvider for HttpStt {
    async fn transcribe(&self, audio: &[u8], lang: &str) -> CoreResult<Option<Transcript>> {
        let inner = &self.inner;
        inner.availability.check()?;
        if audio.is_empty() {
            return Err(CoreError::InvalidArgument("audio buffer is empty".into()));
        }
        if audio.len() > MAX_BATCH_AUDIO_BYTES {
            return Err(CoreError::InvalidArgument(format!(
                "audio buffer {} bytes exceeds cap of {MAX_BATCH_AUDIO_BYTES}",
                audio.len()
            )));
        }
        let key = inner
            .key
            .as_ref()
            .ok_or_else(|| CoreError::ProviderUnavailable("no API key".into()))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| CoreError::ProviderError(e.to_string()))?,
            )
            .text("model", inner.config.model.clone())
            .text("language", lang.to_string())
            .text("response_format", "json");

        debug!(audio_bytes = audio.len(), lang, "stt batch request");
        let response = inner
            .client
            .post(format!("{}/audio/transcriptions", inner.config.base_url))
            .bearer_auth(&key.0)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::ProviderError(format!(
                        "stt request timed out after {} ms",
                        inner.config.timeout_ms
                    ))
                } else {
                    CoreError::ProviderError(format!("stt request failed: {e}"))
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

        let parsed: WireTranscription = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(format!("malformed stt response: {e}")))?;

        if parsed.confidence < inner.config.confidence_floor {
            debug!(
                confidence = parsed.confidence,
                floor = inner.config.confidence_floor,
                "transcript below confidence floor, dropped"
            );
            return Ok(None);
        }
        info!(
            text_len = parsed.text.len(),
            confidence = parsed.confidence,
            "stt transcript"
        );
        Ok(Some(Transcript {
            text: parsed.text,
            confidence: parsed.confidence,
        }))
    }

    async fn open_stream(&self, session: &str, lang: &str) -> CoreResult<SttStream> {
        self.inner.availability.check()?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_QUEUE_CAP);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAP);
        let this = self.clone();
        let lang = lang.to_string();
        let session_name = session.to_string();

        // Buffer chunks until the sink closes, then run one batch pass.
        let task = tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = audio_rx.recv().await {
                buffer.extend_from_slice(&chunk);
            }
            if buffer.is_empty() {
                return;
            }
            match this.transcribe(&buffer, &lang).await {
                Ok(Some(transcript)) => {
                    let _ = events_tx
                        .send(SttEvent {
                            text: transcript.text,
                            confidence: transcript.confidence,
                            is_final: true,
                        })
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %session_name, error = %e, "buffered stt session failed");
                }
            }
        });

        Ok(SttStream {
            session: session.to_string(),
            audio_tx: Some(audio_tx),
            events_rx,
            task,
        })
    }

    fn availability(&self) -> Availability {
        self.inner.availability.clone()
    }

    fn name(&self) -> &str {
        "whisper-batch"
    }
}

// ---------------------------------------------------------------------------
// WsStt
// ---------------------------------------------------------------------------

/// Streaming transcription over a WebSocket endpoint.
///
/// Audio chunks are forwarded as binary frames; the endpoint pushes JSON
/// [`SttEvent`]s back. Final events below the confidence floor are dropped
/// before they reach the consumer.
pub struct WsStt {
    config: SttProviderConfig,
    key: Option<MaskedKey>,
    availability: Availability,
}

impl std::fmt::Debug for WsStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStt")
            .field("stream_url", &self.config.stream_url)
            .field("key", &self.key)
            .field("availability", &self.availability)
            .finish_non_exhaustive()
    }
}

impl WsStt {
    /// Build the adapter; degrades to unavailable on a missing key or a
    /// missing stream URL.
    pub fn new(config: SttProviderConfig) -> Self {
        let (key, mut availability) = match resolve_api_key(&config.api_key_env) {
            Ok(key) => (Some(MaskedKey(key)), Availability::Ready),
            Err(unavailable) => (None, unavailable),
        };
        if config.stream_url.is_empty() && availability.is_ready() {
            availability = Availability::Unavailable("no stream URL configured".into());
        }
        Self {
            config,
            key,
            availability,
        }
    }

    fn stream_url(&self, session: &str, lang: &str) -> CoreResult<url::Url> {
        let mut url = url::Url::parse(&self.config.stream_url)
            .map_err(|e| CoreError::InvalidArgument(format!("bad stream URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("session", session)
            .append_pair("language", lang)
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", "16000");
        Ok(url)
    }
}

#[async_trait]
impl SttProvider for WsStt {
    async fn transcribe(&self, audio: &[u8], lang: &str) -> CoreResult<Option<Transcript>> {
        // One-shot streaming session: push everything, close, await the final.
        let mut stream = self.open_stream("batch", lang).await?;
        stream.push_audio(audio.to_vec()).await?;
        stream.close_sink();
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let result = tokio::time::timeout(deadline, async {
            while let Some(event) = stream.next_event().await {
                if event.is_final {
                    return Some(event);
                }
            }
            None
        })
        .await
        .map_err(|_| CoreError::ProviderError("stt stream timed out".into()))?;
        stream.close().await;
        Ok(result.map(|e| Transcript {
            text: e.text,
            confidence: e.confidence,
        }))
    }

    async fn open_stream(&self, session: &str, lang: &str) -> CoreResult<SttStream> {
        self.availability.check()?;
        let _key = self
            .key
            .as_ref()
            .ok_or_else(|| CoreError::ProviderUnavailable("no API key".into()))?;
        let url = self.stream_url(session, lang)?;

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| CoreError::TransportUnavailable(format!("stt stream dial failed: {e}")))?;
        let (mut sink, mut source) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_QUEUE_CAP);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAP);
        let floor = self.config.confidence_floor;
        let session_name = session.to_string();

        let task = tokio::spawn(async move {
            let mut sink_open = true;
            loop {
                tokio::select! {
                    chunk = audio_rx.recv(), if sink_open => match chunk {
                        Some(chunk) => {
                            if sink.send(Message::Binary(chunk.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Sink closed: tell the endpoint we are done and
                            // keep draining its remaining events.
                            sink_open = false;
                            let _ = sink.send(Message::Close(None)).await;
                        }
                    },
                    message = source.next() => {
                        let text = match message {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => continue,
                        };
                        let event: SttEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                debug!(error = %e, "malformed stt event dropped");
                                continue;
                            }
                        };
                        if event.is_final && event.confidence < floor {
                            debug!(
                                session = %session_name,
                                confidence = event.confidence,
                                floor,
                                "final transcript below confidence floor, dropped"
                            );
                            continue;
                        }
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    },
                }
            }
        });

        Ok(SttStream {
            session: session.to_string(),
            audio_tx: Some(audio_tx),
            events_rx,
            task,
        })
    }

    fn availability(&self) -> Availability {
        self.availability.clone()
    }

    fn name(&self) -> &str {
        "stt-stream"
    }
}
