// ── Chorus Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the pipeline, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure class (connection, persistence,
//     delivery…), matching how the pipeline reacts to them.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Network crates live in the runtime, so their errors are mapped into
//     `Connection` explicitly at the call site.
//   • No variant carries secret material (API keys, tokens) in its message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Upstream platform failure. Retried with backoff up to the cap.
    #[error("Connection error: {platform}: {message}")]
    Connection { platform: String, message: String },

    /// Text that cannot be classified (empty, whitespace only).
    #[error("Classification input error: {0}")]
    ClassificationInput(String),

    /// A batch write failed and was rolled back.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The durable queue backend cannot be reached.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A listener could not accept a frame.
    #[error("Delivery error: {listener}: {message}")]
    Delivery { listener: String, message: String },

    /// Every API key for the platform is out of quota.
    #[error("Quota exceeded: {platform}")]
    QuotaExceeded { platform: String },

    /// No pooled storage connection became free in time.
    #[error("Storage pool exhausted after {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// Lookup of a connection, stream or record that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a connection error for a platform.
    pub fn connection(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection { platform: platform.into(), message: message.into() }
    }

    /// Create a delivery error for a listener.
    pub fn delivery(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery { listener: listener.into(), message: message.into() }
    }

    pub fn quota_exceeded(platform: impl Into<String>) -> Self {
        Self::QuotaExceeded { platform: platform.into() }
    }

    /// Whether the caller may repeat the operation and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::PoolExhausted { .. } | Self::QueueUnavailable(_) | Self::Io(_)
        )
    }

    /// The taxonomy class used for aggregated error counters.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } | Self::QuotaExceeded { .. } => ErrorClass::Connection,
            Self::ClassificationInput(_) => ErrorClass::ClassificationInput,
            Self::QueueUnavailable(_) => ErrorClass::QueueUnavailable,
            Self::Delivery { .. } => ErrorClass::Delivery,
            Self::Database(_) | Self::Persistence(_) | Self::PoolExhausted { .. } => ErrorClass::Persistence,
            _ => ErrorClass::Other,
        }
    }
}

// ── Error classes ──────────────────────────────────────────────────────────
// Only aggregated counts per class are surfaced through stats.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Connection,
    ClassificationInput,
    Persistence,
    QueueUnavailable,
    Delivery,
    QuotaWarning,
    Other,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 7] = [
        ErrorClass::Connection,
        ErrorClass::ClassificationInput,
        ErrorClass::Persistence,
        ErrorClass::QueueUnavailable,
        ErrorClass::Delivery,
        ErrorClass::QuotaWarning,
        ErrorClass::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Connection => "connection",
            ErrorClass::ClassificationInput => "classification_input",
            ErrorClass::Persistence => "persistence",
            ErrorClass::QueueUnavailable => "queue_unavailable",
            ErrorClass::Delivery => "delivery",
            ErrorClass::QuotaWarning => "quota_warning",
            ErrorClass::Other => "other",
        }
    }
}

// ── String bridges ─────────────────────────────────────────────────────────

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All pipeline operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
