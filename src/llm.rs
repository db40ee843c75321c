//! Model invocation service
//!
//! Provides a common interface for generating text from the supported
//! model providers.

mod anthropic;
mod error;
mod openai;
mod registry;

pub use anthropic::AnthropicService;
pub use error::LlmError;
pub use openai::OpenAiService;
pub use registry::{LlmConfig, ModelRegistry};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Common interface for model providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Generate text for a prompt
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;

    /// Get the provider this model belongs to
    fn provider(&self) -> Provider;
}

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::OpenAi => "OpenAI",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Logging wrapper for model services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.generate(prompt).await;
        let duration = start.elapsed();

        match &result {
            Ok(text) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    response_chars = text.len(),
                    "generation completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "generation failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> Provider {
        self.inner.provider()
    }
}
