//! Provider adapters: uniform façades over external LLM, TTS, and STT
//! vendors.
//!
//! Adapters are process-wide singletons created at startup. A missing
//! credential never blocks startup: the adapter is constructed in an
//! [`Availability::Unavailable`] state and every call on it fails
//! `ProviderUnavailable` until the credential appears at restart.
//!
//! # Security
//!
//! - API keys come from environment variables, never from config files or
//!   request payloads, and are masked in Debug output.
//! - Text sent to TTS is sanitized (control characters stripped, length
//!   capped) before it reaches any vendor API.
//! - Request and response body sizes are capped.
//! - Logs carry metadata (lengths, formats, hashes), not content.

pub mod llm;
pub mod stt;
pub mod tts;

pub use llm::{ChatTurn, ChatRole, HttpLlm, LlmProvider, LlmProviderConfig, LlmReply, RateGate, TokenLedger};
pub use stt::{HttpStt, SttEvent, SttProvider, SttProviderConfig, SttStream, Transcript, WsStt};
pub use tts::{CachingTts, HttpTts, TtsAudio, TtsProvider, TtsProviderConfig};

use chorus_types::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Readiness of a provider adapter.
///
/// Adapters report unavailability instead of failing construction so the
/// rest of the core can start without every credential present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The adapter is ready to serve requests.
    Ready,
    /// The adapter cannot serve requests; the reason is human-readable.
    Unavailable(String),
}

impl Availability {
    /// Whether the adapter is ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready)
    }

    /// Error to surface when a call is attempted while unavailable.
    pub fn check(&self) -> CoreResult<()> {
        match self {
            Availability::Ready => Ok(()),
            Availability::Unavailable(reason) => {
                Err(CoreError::ProviderUnavailable(reason.clone()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Credential helpers
// ---------------------------------------------------------------------------

/// Resolve an API key from an environment variable.
///
/// Returns [`Availability::Unavailable`] (not an error) when the variable
/// is unset or empty, so constructors can degrade instead of failing.
pub(crate) fn resolve_api_key(env_var: &str) -> Result<String, Availability> {
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        Ok(_) => Err(Availability::Unavailable(format!(
            "API key is empty: environment variable {env_var}"
        ))),
        Err(_) => Err(Availability::Unavailable(format!(
            "missing API key: environment variable {env_var} is not set"
        ))),
    }
}

/// An API key that masks itself in Debug output.
#[derive(Clone)]
pub(crate) struct MaskedKey(pub(crate) String);

impl std::fmt::Debug for MaskedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() > 8 {
            write!(f, "{}…(masked)", &self.0[..4])
        } else {
            f.write_str("(masked)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_check() {
        assert!(Availability::Ready.check().is_ok());
        let err = Availability::Unavailable("no key".into()).check().unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }

    #[test]
    fn masked_key_debug_hides_value() {
        let key = MaskedKey("sk-super-secret-value".into());
        let debug = format!("{key:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("masked"));
    }

    #[test]
    fn resolve_missing_key_degrades() {
        let result = resolve_api_key("CHORUS_TEST_KEY_THAT_DOES_NOT_EXIST");
        assert!(matches!(result, Err(Availability::Unavailable(_))));
    }
}
