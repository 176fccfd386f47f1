//! Error types for every stage of the relay.
//!
//! The split follows where an error is handled:
//! - [`RelayError`]: one upstream chat attempt. Pre-stream variants trigger fallback.
//! - [`ChatError`]: request-level failures that become an HTTP status.
//! - [`StorageError`]: transcript persistence. Logged, never shown to the user.
//! - [`ImageError`]: the image passthrough.
//! - [`ConfigError`]: startup configuration.
//! - [`ServerError`]: the HTTP front itself (socket and framing problems).

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single upstream chat attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Upstream answered 429 before any token was streamed.
    #[error("RATE_LIMIT")]
    RateLimited,
    /// Upstream answered 503 (model loading or unavailable) before streaming.
    #[error("MODEL_LOADING")]
    ModelUnavailable,
    /// Any other failure before the first token reached the caller.
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
    /// The stream broke after tokens were already forwarded.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl RelayError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        RelayError::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Whether switching to the next candidate model may help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RelayError::StreamInterrupted(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RelayError::RateLimited)
    }
}

/// Request-level failure, mapped onto an HTTP status by the web front.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),
    /// Every candidate failed before the first token.
    #[error("{}", exhausted_message(.rate_limited, .last_error))]
    FallbackExhausted {
        rate_limited: bool,
        last_error: String,
    },
    #[error("Server is shutting down. Please retry shortly.")]
    ShuttingDown,
}

fn exhausted_message(rate_limited: &bool, last_error: &str) -> String {
    if *rate_limited {
        "All AI models are temporarily busy (Rate Limit). Please wait a few seconds.".to_string()
    } else {
        format!("All AI models are busy or unreachable. Last Error: {}", last_error)
    }
}

impl ChatError {
    pub fn status(&self) -> u16 {
        match self {
            ChatError::InvalidRequest(_) => 400,
            ChatError::FallbackExhausted { .. } | ChatError::ShuttingDown => 503,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transcript I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcript encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote transcript store failed: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("{0}")]
    Request(String),
    #[error("{message}")]
    Upstream { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("cannot build HTTP client: {0}")]
    Client(String),
    #[error("cannot open transcript store: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed HTTP request: {0}")]
    Malformed(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}
