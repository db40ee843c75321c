//! Provider error types

use thiserror::Error;

/// Failure reported by a model provider.
///
/// Turn orchestration folds any of these into the response step's content,
/// so classification only affects how the failure is logged.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider error: {0}")]
    Server(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a fresh attempt could plausibly succeed. Auth and request
    /// shape problems will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::Server(_)
        )
    }
}
