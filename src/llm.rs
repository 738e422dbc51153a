//! Model Providers
//!
//! `ModelProvider` is the plugin boundary for text generation. `LlmClient`
//! speaks the OpenAI-compatible chat-completions protocol and is what the
//! binary wires in for both the primary and the secondary model.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One completion call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_text: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_text: user_text.into(),
            max_tokens: 500,
            temperature: 0.1,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Text-completion provider. Swappable without touching pipeline logic.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Name used in logs and as the `source` of generated queries
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible chat-completions client
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            http: reqwest::Client::new(),
        }
    }

    /// Client with a transport-level timeout on top of the tier timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_text}
            ],
            "temperature": request.temperature,
        });

        // Newer models reject max_tokens in favour of max_completion_tokens
        if self.model.starts_with("gpt-5") || self.model.starts_with("gpt-4") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(request.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }

        body
    }

    async fn call_llm(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.build_body(request);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Provider(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlqError::Provider(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Provider(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pull `choices[0].message.content` out of a chat-completions response
fn extract_content(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(NlqError::Provider(format!("LLM API error: {}", error)));
    }

    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| NlqError::Provider("No choices array in LLM response".to_string()))?;

    let first = choices
        .first()
        .ok_or_else(|| NlqError::Provider("Empty choices array in LLM response".to_string()))?;

    match first.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(NlqError::Provider("LLM response was filtered by content policy".to_string()));
        }
        _ => {}
    }

    let content = first["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or("");

    if content.is_empty() {
        return Err(NlqError::Provider("Empty content in LLM response".to_string()));
    }

    Ok(content.to_string())
}

#[async_trait]
impl ModelProvider for LlmClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!(model = %self.model, "Requesting completion");
        self.call_llm(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content() {
        let response = serde_json::json!({
            "choices": [{"message": {"content": "  SELECT 1  "}, "finish_reason": "stop"}]
        });
        assert_eq!(extract_content(&response).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_content_rejects_empty_and_errors() {
        let empty = serde_json::json!({"choices": [{"message": {"content": ""}}]});
        assert!(extract_content(&empty).is_err());

        let error = serde_json::json!({"error": {"message": "model overloaded"}});
        assert!(extract_content(&error).is_err());

        let filtered = serde_json::json!({
            "choices": [{"message": {"content": "x"}, "finish_reason": "content_filter"}]
        });
        assert!(extract_content(&filtered).is_err());
    }

    #[test]
    fn test_body_token_field() {
        let request = CompletionRequest::new("sys", "user").with_max_tokens(300);
        let mistral = LlmClient::new("k".into(), "mistralai/Mistral-7B-Instruct-v0.2".into(), "http://x".into());
        let body = mistral.build_body(&request);
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"][1]["content"], "user");

        let gpt = LlmClient::new("k".into(), "gpt-4o-mini".into(), "http://x".into());
        assert_eq!(gpt.build_body(&request)["max_completion_tokens"], 300);
    }
}
