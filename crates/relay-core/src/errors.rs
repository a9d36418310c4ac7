use std::time::Duration;

/// Errors surfaced by an agent's underlying model call.
/// Classified as retryable (the engine retries with backoff) or fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    // Fatal: retrying cannot help
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: usize, actual: usize },

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("model provider overloaded")]
    Overloaded,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("response interrupted: {0}")]
    Interrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Overloaded
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::Interrupted(_)
        )
    }

    /// Server-suggested retry delay, if any (rate limit responses carry one).
    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Interrupted(_) => "interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
