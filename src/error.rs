//! Error types for the orchestrator
//!
//! Two layers of failure live here:
//! - [`ErrorKind`]: the per-call failure taxonomy a provider invocation can end in. These are
//!   data, recorded on attempts and carried by outcomes, never thrown past the executor.
//! - [`OrchestratorError`]: what a caller of the executor, shadow runner or aggregator can
//!   actually receive as an `Err`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower::BoxError;

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Classification of a failed provider invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not complete in time.
    Timeout,
    /// The provider throttled the call; `retry_after_ms` is its hint, if it sent one.
    RateLimit { retry_after_ms: Option<u64> },
    /// Transient failure (5xx, connection reset, ...).
    Retriable,
    /// The provider declined to run. Never consumes a retry slot.
    ProviderSkip,
    /// Non-retriable failure such as a malformed request.
    Fatal,
}

impl ErrorKind {
    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        ErrorKind::RateLimit {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }

    /// Whether the same provider may be called again after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimit { .. } | ErrorKind::Retriable
        )
    }

    /// Stable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit { .. } => "rate_limit",
            ErrorKind::Retriable => "retriable",
            ErrorKind::ProviderSkip => "provider_skip",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimit {
                retry_after_ms: Some(ms),
            } => write!(f, "rate_limit (retry after {}ms)", ms),
            other => f.write_str(other.label()),
        }
    }
}

/// Typed error a provider returns (boxed) to tell the executor how it failed.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "provider call timed out")
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::rate_limit(retry_after), "provider rate limited")
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retriable, message)
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderSkip, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Map an arbitrary service error onto the failure taxonomy.
///
/// `ProviderError` keeps its kind, Tower/Tokio timeouts become `Timeout`, everything else is
/// treated as transient.
pub fn classify(error: &BoxError) -> ErrorKind {
    if let Some(e) = error.downcast_ref::<ProviderError>() {
        return e.kind.clone();
    }
    if error.is::<tower::timeout::error::Elapsed>() || error.is::<tokio::time::error::Elapsed>() {
        return ErrorKind::Timeout;
    }
    ErrorKind::Retriable
}

/// Main error type for the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The fallback chain has no providers
    #[error("Configuration error: fallback chain is empty")]
    EmptyFallbackChain,

    /// A provider id appears twice without being marked as a repeat
    #[error("Configuration error: provider '{provider}' appears more than once in the fallback chain")]
    DuplicateProvider { provider: String },

    /// Any other invalid configuration value
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    /// No parallel candidate produced a successful response
    #[error("All {} candidates failed", .failures.len())]
    AggregateExhausted { failures: Vec<CandidateFailure> },

    /// Too few candidates reached a terminal outcome within the cost/time budget
    #[error("Quorum unmet: {completed} of {required} required candidates completed")]
    QuorumUnmet { completed: usize, required: usize },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        OrchestratorError::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Terminal failure of one parallel candidate, as carried by `AggregateExhausted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub slot: usize,
    /// `None` when the candidate was cancelled before reaching a provider verdict.
    pub kind: Option<ErrorKind>,
}
