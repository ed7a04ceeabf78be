//! Chat-completion model seam and the Azure-deployment HTTP implementation.

use crate::config::Deployment;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// One completion request. `response_json` asks the deployment for a
/// `json_object` response format.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_json: bool,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.2,
            max_tokens: 800,
            response_json: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.response_json = true;
        self
    }
}

/// Chat completion capability. Implemented over HTTP for deployments and by
/// scripted mocks in tests.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String>;
}

/// Azure-OpenAI-style deployment client.
pub struct AzureChatModel {
    deployment: Deployment,
    client: reqwest::Client,
}

impl AzureChatModel {
    pub fn new(deployment: Deployment, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { deployment, client }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.deployment.endpoint.trim_end_matches('/'),
            self.deployment.deployment,
            self.deployment.api_version,
        )
    }
}

#[async_trait]
impl ChatModel for AzureChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let mut body = serde_json::json!({
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.response_json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.deployment.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::CompletionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::CompletionFailed(format!("{status}: {text}")).into());
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::CompletionFailed(e.to_string()))?;

        let choice = payload["choices"]
            .get(0)
            .ok_or_else(|| LlmError::CompletionFailed("no choices in response".to_string()))?;

        // A truncated completion cannot be trusted to carry a complete JSON
        // document; callers retry with a larger budget.
        if choice["finish_reason"].as_str() == Some("length") {
            return Err(LlmError::LengthExceeded.into());
        }

        let content = choice["message"]["content"].as_str().unwrap_or("");
        Ok(content.to_string())
    }
}

/// Parse a JSON completion, tolerating markdown code fences around the body.
pub fn parse_json_completion(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    serde_json::from_str(body)
        .map_err(|e| LlmError::ParsingFailed(format!("{e}: {body}")).into())
}

#[cfg(test)]
mod tests {
    use super::parse_json_completion;

    #[test]
    fn parses_plain_json() {
        let value = parse_json_completion(r#"{"mode": "search"}"#).expect("parse");
        assert_eq!(value["mode"].as_str(), Some("search"));
    }

    #[test]
    fn parses_fenced_json() {
        let value =
            parse_json_completion("```json\n{\"mode\": \"chat\"}\n```").expect("parse fenced");
        assert_eq!(value["mode"].as_str(), Some("chat"));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_json_completion("I would classify this as search.").is_err());
    }
}
