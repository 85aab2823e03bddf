//! An OpenAI-compatible chat-completions backend.
//!
//! Speaks the `/v1/chat/completions` JSON shape shared by OpenAI and the many
//! self-hosted/third-party endpoints that mirror it. Built directly on `reqwest` and
//! `serde_json` rather than a vendor-specific client crate, so the same implementation
//! serves any [`ProviderDescriptor`](crate::core::provider::ProviderDescriptor) whose
//! endpoint speaks this format — only the base URL, model, and credentials differ.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::core::providers::openai_compatible::OpenAiCompatibleProvider;
//!
//! let provider = OpenAiCompatibleProvider::new(
//!     "https://api.openai.com/v1/chat/completions",
//!     "gpt-4o-mini",
//!     std::env::var("OPENAI_API_KEY").unwrap_or_default(),
//! );
//! ```

use crate::core::provider::{GenerationOutcome, GenerationParams, Provider, ProviderCallError};
use crate::core::providers::http_pool::get_shared_http_client;
use async_trait::async_trait;
use log::error;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// A provider backend speaking the OpenAI-compatible `/v1/chat/completions` format.
pub struct OpenAiCompatibleProvider {
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutcome, ProviderCallError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let response = get_shared_http_client()
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!("openai_compatible provider transport error: {}", err);
                ProviderCallError::Transient(err.to_string())
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderCallError::Auth(text));
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(ProviderCallError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderCallError::Transient(format!(
                "http {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|err| {
            error!("openai_compatible provider decode error: {}", err);
            ProviderCallError::Transient(err.to_string())
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderCallError::Transient("empty choices array".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(GenerationOutcome {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_given_fields() {
        let provider = OpenAiCompatibleProvider::new("https://example.test/v1/chat/completions", "gpt-4o-mini", "sk-test");
        assert_eq!(provider.model, "gpt-4o-mini");
        assert_eq!(provider.endpoint, "https://example.test/v1/chat/completions");
    }
}
