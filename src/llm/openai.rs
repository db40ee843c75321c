//! OpenAI provider implementation

use super::{LlmError, LlmService, Provider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenAI chat completions service
pub struct OpenAiService {
    client: Client,
    api_key: String,
    api_name: String,
    model_id: String,
    base_url: String,
}

impl OpenAiService {
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
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
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
impl LlmService for OpenAiService {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.api_name.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Other(format!("failed to parse response: {e} - body: {body}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Other("response contained no choices".to_string()))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
