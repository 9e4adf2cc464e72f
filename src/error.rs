//! Error types for the siphon runtime.
//!
//! Stage failures carry a stable error code (SCREAMING_SNAKE_CASE) in their
//! Display output, accessible via [`StageError::code()`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable error codes for programmatic handling of stage failures.
pub mod error_codes {
    /// Transient provider failure (network blip, rate limit). Retryable.
    pub const STAGE_TRANSIENT: &str = "STAGE_TRANSIENT";

    /// Fatal provider failure (auth rejected, malformed config). Not retried.
    pub const STAGE_FATAL: &str = "STAGE_FATAL";

    /// The stage was cancelled before it produced a result.
    pub const STAGE_CANCELLED: &str = "STAGE_CANCELLED";
}

/// The three streaming stages of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Speech-to-text.
    Stt,
    /// Language model.
    Llm,
    /// Text-to-speech.
    Tts,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
        };
        f.write_str(name)
    }
}

/// Typed failure of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{}] {kind} stage: {message}", self.code())]
pub struct StageError {
    /// Which stage failed.
    pub kind: StageKind,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
    /// Set when the failure is the result of a cancellation.
    pub cancelled: bool,
    /// Provider-supplied detail.
    pub message: String,
}

impl StageError {
    /// A transient, retryable failure.
    pub fn transient(kind: StageKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            cancelled: false,
            message: message.into(),
        }
    }

    /// A fatal failure that must not be retried.
    pub fn fatal(kind: StageKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            cancelled: false,
            message: message.into(),
        }
    }

    /// The stage was cancelled by its owner.
    pub fn cancelled(kind: StageKind) -> Self {
        Self {
            kind,
            retryable: false,
            cancelled: true,
            message: "cancelled".to_owned(),
        }
    }

    /// Returns the stable error code for this failure.
    pub fn code(&self) -> &'static str {
        if self.cancelled {
            error_codes::STAGE_CANCELLED
        } else if self.retryable {
            error_codes::STAGE_TRANSIENT
        } else {
            error_codes::STAGE_FATAL
        }
    }

    /// Returns true if the failure is transient and the request can be retried.
    pub fn is_retryable(&self) -> bool {
        self.retryable && !self.cancelled
    }
}

/// Media transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote side went away.
    #[error("transport closed")]
    Closed,
    /// A single frame could not be delivered.
    #[error("frame delivery failed: {0}")]
    Delivery(String),
}

/// Worker placement failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No live, non-draining worker is registered.
    #[error("no live workers available")]
    NoLiveWorkers,
    /// The referenced worker is not in the registry.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    /// The call has already been placed on a worker.
    #[error("call {0} is already placed")]
    AlreadyPlaced(String),
}

/// Top-level error type for the siphon runtime.
#[derive(Debug, thiserror::Error)]
pub enum SiphonError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline stage failure.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Media transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Worker placement failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Call session error.
    #[error("session error: {0}")]
    Session(String),

    /// Persistence sink error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Caller memory store error.
    #[error("memory error: {0}")]
    Memory(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SiphonError>;
