//! Anthropic provider implementation

use super::{LlmError, LlmService, Provider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anthropic service implementation
pub struct AnthropicService {
    client: Client,
    api_key: String,
    api_name: String,
    model_id: String,
    base_url: String,
}

impl AnthropicService {
    pub fn new(api_key: String, model_id: &str, api_name: &str) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| LlmError::Other(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            api_name: api_name.to_string(),
            model_id: model_id.to_string(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
        })
    }

    fn classify_error(&self, status: reqwest::StatusCode, body: &str) -> LlmError {
        let message = body.to_string();
        match status.as_u16() {
            401 | 403 => LlmError::Auth(message),
            429 => LlmError::RateLimited(message),
            400 => LlmError::InvalidRequest(message),
            500..=599 => LlmError::Server(message),
            _ => LlmError::Other(format!("HTTP {status}: {message}")),
        }
    }
}

#[async_trait]
impl LlmService for AnthropicService {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let request = AnthropicRequest {
            model: self.api_name.clone(),
            max_tokens: 4096,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Network(e.to_string())
                } else {
                    LlmError::Other(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(self.classify_error(status, &body));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Other(format!("failed to parse response: {e} - body: {body}")))?;

        Ok(parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join(""))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}
