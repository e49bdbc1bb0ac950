//! Error types for notifier sinks.

use thiserror::Error;

/// Delivery failures. The pipeline treats every variant as fatal.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Sink is missing a credential or destination
    #[error("notifier not configured: {0}")]
    NotConfigured(String),

    /// Slack answered 200 with `ok: false`
    #[error("slack API error: {0}")]
    Api(String),

    /// Rate limited by the service
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Non-success HTTP status
    #[error("slack returned {status}: {body}")]
    Status { status: u16, body: String },
}
