//! Language-model adapter.
//!
//! [`LlmProvider`] is the trait seam the agent speaks through;
//! [`HttpLlm`] implements it against an OpenAI-compatible chat-completions
//! endpoint. The adapter enforces a minimum inter-request interval per
//! agent (excess is rejected, not queued) and accumulates token counts per
//! model tag.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use chorus_types::{CoreError, CoreResult, LlmParams};

use crate::{resolve_api_key, Availability, MaskedKey};

/// Maximum serialized request body size (1 MB).
const MAX_REQUEST_BODY_BYTES: usize = 1_000_000;

/// Maximum persona length forwarded as the system directive.
const MAX_PERSONA_CHARS: usize = 100_000;

// ---------------------------------------------------------------------------
// Request/response model
// ---------------------------------------------------------------------------

/// Role of one chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The persona directive.
    System,
    /// A turn attributed to some other participant.
    User,
    /// A turn the agent itself produced.
    Assistant,
}

/// One attributed turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    /// Origin id of the turn, used for attribution in the prompt.
    pub speaker: String,
    pub content: String,
}

impl ChatTurn {
    /// A turn spoken by another participant, attributed by origin id.
    pub fn user(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            speaker: speaker.into(),
            content: content.into(),
        }
    }

    /// A turn the agent produced itself.
    pub fn assistant(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            speaker: speaker.into(),
            content: content.into(),
        }
    }
}

/// A generated reply.
#[derive(Debug, Clone)]
pub struct LlmReply {
    /// The reply text.
    pub text: String,
    /// Which provider/model produced it.
    pub model_tag: String,
    /// Total tokens the call consumed, when the provider reports it.
    pub tokens: u64,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Trait seam for language-model backends.
///
/// `caller` identifies the requesting agent for per-agent rate gating.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a reply from a persona and attributed history.
    async fn generate(
        &self,
        caller: &str,
        persona: &str,
        history: &[ChatTurn],
        params: &LlmParams,
    ) -> CoreResult<LlmReply>;

    /// Adapter readiness.
    fn availability(&self) -> Availability;

    /// Provider name for logs and model tags.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// RateGate
// ---------------------------------------------------------------------------

/// Per-caller minimum-interval gate.
///
/// A request inside the interval is rejected with `RateLimited`; it is
/// never queued.
pub struct RateGate {
    min_interval: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RateGate {
    /// Create a gate with the given minimum interval between requests.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request from `caller`, recording admission time.
    pub fn admit(&self, caller: &str) -> CoreResult<()> {
        if self.min_interval.is_zero() {
            return Ok(());
        }
        let Ok(mut seen) = self.last_seen.lock() else {
            return Ok(());
        };
        let now = Instant::now();
        if let Some(last) = seen.get(caller) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.min_interval {
                return Err(CoreError::RateLimited(format!(
                    "caller {caller} must wait {} ms between requests ({} ms elapsed)",
                    self.min_interval.as_millis(),
                    elapsed.as_millis()
                )));
            }
        }
        seen.insert(caller.to_string(), now);
        Ok(())
    }

    /// Forget a caller (on agent deletion).
    pub fn forget(&self, caller: &str) {
        if let Ok(mut seen) = self.last_seen.lock() {
            seen.remove(caller);
        }
    }
}

// ---------------------------------------------------------------------------
// TokenLedger
// ---------------------------------------------------------------------------

/// Token accounting accumulated per model tag.
#[derive(Default)]
pub struct TokenLedger {
    totals: Mutex<HashMap<String, u64>>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add tokens under a model tag.
    pub fn record(&self, model_tag: &str, tokens: u64) {
        if let Ok(mut totals) = self.totals.lock() {
            *totals.entry(model_tag.to_string()).or_insert(0) += tokens;
        }
    }

    /// Snapshot of all accumulated totals.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.totals.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

/// Validate generation parameters before any network call.
pub fn validate_params(persona: &str, params: &LlmParams) -> CoreResult<()> {
    if persona.trim().is_empty() {
        return Err(CoreError::InvalidArgument("persona must not be empty".into()));
    }
    if persona.len() > MAX_PERSONA_CHARS {
        return Err(CoreError::InvalidArgument(format!(
            "persona exceeds {MAX_PERSONA_CHARS} characters"
        )));
    }
    if params.model.is_empty() {
        return Err(CoreError::InvalidArgument("model name must not be empty".into()));
    }
    if !params
        .model
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '/')
    {
        return Err(CoreError::InvalidArgument(format!(
            "model name contains invalid characters: '{}'",
            params.model
        )));
    }
    if !(0.0..=2.0).contains(&params.temperature) {
        return Err(CoreError::InvalidArgument(format!(
            "temperature must be between 0.0 and 2.0, got {}",
            params.temperature
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HttpLlm
// ---------------------------------------------------------------------------

/// Configuration for the HTTP LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    /// Chat-completions endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Minimum interval between requests from one agent, in milliseconds.
    pub min_interval_ms: u64,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 30_000,
            min_interval_ms: 2_000,
        }
    }
}

/// OpenAI-compatible chat-completions adapter.
pub struct HttpLlm {
    client: reqwest::Client,
    config: LlmProviderConfig,
    key: Option<MaskedKey>,
    availability: Availability,
    gate: RateGate,
    ledger: TokenLedger,
}

impl std::fmt::Debug for HttpLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlm")
            .field("base_url", &self.config.base_url)
            .field("key", &self.key)
            .field("availability", &self.availability)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl HttpLlm {
    /// Build the adapter. Never fails on a missing key; the adapter comes
    /// up unavailable instead.
    pub fn new(config: LlmProviderConfig) -> Self {
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
        let gate = RateGate::new(Duration::from_millis(config.min_interval_ms));
        Self {
            client,
            config,
            key,
            availability,
            gate,
            ledger: TokenLedger::new(),
        }
    }

    /// Token totals accumulated per model tag.
    pub fn token_totals(&self) -> HashMap<String, u64> {
        self.ledger.snapshot()
    }

    /// Forget rate-gate state for a caller.
    pub fn forget_caller(&self, caller: &str) {
        self.gate.forget(caller);
    }

    /// Render attributed history into wire messages. Persona becomes the
    /// system directive; other participants' turns are prefixed with their
    /// origin id so the model can tell speakers apart.
    fn wire_messages<'a>(
        persona: &'a str,
        history: &'a [ChatTurn],
        rendered: &'a mut Vec<String>,
    ) -> Vec<WireMessage<'a>> {
        rendered.clear();
        for turn in history {
            rendered.push(match turn.role {
                ChatRole::User => format!("{}: {}", turn.speaker, turn.content),
                _ => turn.content.clone(),
            });
        }
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: persona,
        });
        for (turn, content) in history.iter().zip(rendered.iter()) {
            messages.push(WireMessage {
                role: match turn.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content,
            });
        }
        messages
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    async fn generate(
        &self,
        caller: &str,
        persona: &str,
        history: &[ChatTurn],
        params: &LlmParams,
    ) -> CoreResult<LlmReply> {
        self.availability.check()?;
        validate_params(persona, params)?;
        self.gate.admit(caller)?;

        let mut rendered = Vec::new();
        let messages = Self::wire_messages(persona, history, &mut rendered);
        let body = serde_json::json!({
            "model": params.model,
            "temperature": params.temperature,
            "messages": messages,
        });
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| CoreError::ProviderError(format!("request encoding failed: {e}")))?;
        if body_bytes.len() > MAX_REQUEST_BODY_BYTES {
            return Err(CoreError::InvalidArgument(format!(
                "request body {} bytes exceeds cap of {MAX_REQUEST_BODY_BYTES}",
                body_bytes.len()
            )));
        }

        let key = self
            .key
            .as_ref()
            .ok_or_else(|| CoreError::ProviderUnavailable("no API key".into()))?;

        debug!(
            caller,
            model = %params.model,
            turns = history.len(),
            "llm request"
        );
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&key.0)
            .header("content-type", "application/json")
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::ProviderError(format!(
                        "llm request timed out after {} ms",
                        self.config.timeout_ms
                    ))
                } else {
                    CoreError::ProviderError(format!("llm request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CoreError::RateLimited("provider returned 429".into()));
        }
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

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(format!("malformed llm response: {e}")))?;

        let mut text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.len() > params.max_reply_chars {
            // Truncate on a char boundary at the reply-length cap.
            let cut = text
                .char_indices()
                .take_while(|(i, _)| *i <= params.max_reply_chars)
                .last()
                .map(|(i, _)| i)
                .unwrap_or(0);
            text.truncate(cut);
        }

        let model_tag = parsed.model.unwrap_or_else(|| params.model.clone());
        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        self.ledger.record(&model_tag, tokens);

        info!(
            caller,
            model = %model_tag,
            tokens,
            latency_ms = started.elapsed().as_millis() as u64,
            reply_len = text.len(),
            "llm reply"
        );
        Ok(LlmReply {
            text,
            model_tag,
            tokens,
        })
    }

    fn availability(&self) -> Availability {
        self.availability.clone()
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_gate_rejects_within_interval() {
        let gate = RateGate::new(Duration::from_secs(60));
        assert!(gate.admit("a1").is_ok());
        let err = gate.admit("a1").unwrap_err();
        assert!(matches!(err, CoreError::RateLimited(_)));

        // Other callers are independent.
        assert!(gate.admit("a2").is_ok());
    }

    #[test]
    fn rate_gate_zero_interval_is_open() {
        let gate = RateGate::new(Duration::ZERO);
        for _ in 0..100 {
            assert!(gate.admit("a1").is_ok());
        }
    }

    #[test]
    fn rate_gate_forget_resets() {
        let gate = RateGate::new(Duration::from_secs(60));
        assert!(gate.admit("a1").is_ok());
        gate.forget("a1");
        assert!(gate.admit("a1").is_ok());
    }

    #[test]
    fn token_ledger_accumulates_per_tag() {
        let ledger = TokenLedger::new();
        ledger.record("gpt-4o-mini", 100);
        ledger.record("gpt-4o-mini", 50);
        ledger.record("gpt-4o", 10);

        let totals = ledger.snapshot();
        assert_eq!(totals.get("gpt-4o-mini"), Some(&150));
        assert_eq!(totals.get("gpt-4o"), Some(&10));
    }

    #[test]
    fn validate_rejects_bad_params() {
        let params = LlmParams::default();
        assert!(validate_params("a persona", &params).is_ok());
        assert!(validate_params("", &params).is_err());
        assert!(validate_params("   ", &params).is_err());

        let mut bad = params.clone();
        bad.model = String::new();
        assert!(validate_params("p", &bad).is_err());

        let mut bad = params.clone();
        bad.model = "model with spaces".into();
        assert!(validate_params("p", &bad).is_err());

        let mut bad = params;
        bad.temperature = 3.0;
        assert!(validate_params("p", &bad).is_err());
    }

    #[test]
    fn wire_messages_attribute_user_turns() {
        let history = vec![
            ChatTurn::user("alice", "hello there"),
            ChatTurn::assistant("bot", "hi alice"),
        ];
        let mut rendered = Vec::new();
        let messages = HttpLlm::wire_messages("persona text", &history, &mut rendered);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "persona text");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "alice: hello there");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[2].content, "hi alice");
    }

    #[tokio::test]
    async fn unavailable_adapter_rejects_calls() {
        let config = LlmProviderConfig {
            api_key_env: "CHORUS_TEST_NO_SUCH_KEY".into(),
            ..LlmProviderConfig::default()
        };
        let llm = HttpLlm::new(config);
        assert!(!llm.availability().is_ready());

        let err = llm
            .generate("a1", "persona", &[], &LlmParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }
}
