//! Error taxonomy shared across all chorus crates.
//!
//! Every fallible core operation reports one of a closed set of error
//! kinds. [`CoreError`] carries the kind plus a human-readable message;
//! [`ErrorKind`] is the bare discriminant for exhaustive matching and for
//! serializing into failure events.

use serde::{Deserialize, Serialize};

/// Convenience alias for results in the chorus core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur across the chorus runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Target agent or room does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id on create, or re-attach of an already attached agent.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Missing persona, empty text, unknown room, or ill-formed payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Global or per-room agent cap reached.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A bounded queue is full or an operation is already in progress.
    #[error("busy: {0}")]
    Busy(String),

    /// Provider adapter is missing credentials or not ready.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Upstream vendor returned an error or the call timed out.
    #[error("provider error: {0}")]
    ProviderError(String),

    /// Provider-local rate gate tripped.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Bus or media transport is down.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Media reconnection budget exhausted; the binding is torn down.
    #[error("media unrecoverable: {0}")]
    MediaUnrecoverable(String),

    /// An explicit cancel/stop interrupted the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CoreError {
    /// The bare kind of this error, for exhaustive matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CoreError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            CoreError::Busy(_) => ErrorKind::Busy,
            CoreError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            CoreError::ProviderError(_) => ErrorKind::ProviderError,
            CoreError::RateLimited(_) => ErrorKind::RateLimited,
            CoreError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            CoreError::MediaUnrecoverable(_) => ErrorKind::MediaUnrecoverable,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// The closed set of error kinds surfaced by core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    CapacityExceeded,
    Busy,
    ProviderUnavailable,
    ProviderError,
    RateLimited,
    TransportUnavailable,
    MediaUnrecoverable,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Busy => "busy",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::MediaUnrecoverable => "media_unrecoverable",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
