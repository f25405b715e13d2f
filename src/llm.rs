use crate::config::Settings;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque text-completion capability: one system instruction, one user prompt,
/// one response text. No streaming.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, system_instruction: &str, user_prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Result<Self> {
        Self::with_options(api_key, model, base_url, 0.0, Duration::from_secs(30))
    }

    pub fn with_options(
        api_key: String,
        model: String,
        base_url: String,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Llm(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            http,
        })
    }

    /// Build a client from settings; `None` when no API key is configured.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        match &settings.openai_api_key {
            Some(key) => Self::with_options(
                key.clone(),
                settings.model.clone(),
                settings.openai_base_url.clone(),
                settings.temperature,
                settings.llm_timeout,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, system_instruction: &str, user_prompt: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_instruction},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": self.temperature,
        });

        // Reasoning models spend tokens before answering
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(4000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else {
            body["max_tokens"] = serde_json::json!(2000);
        }

        debug!("Calling chat completions: model={}", self.model);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AgentError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AgentError::Llm("No choices array in LLM response".to_string()))?;

        let first = choices
            .first()
            .ok_or_else(|| AgentError::Llm("Empty choices array in LLM response".to_string()))?;

        match first.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(AgentError::Llm("LLM response was filtered by content policy".to_string()))
            }
            _ => {}
        }

        let content = first["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(AgentError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

#[async_trait]
impl TextCompletion for LlmClient {
    async fn complete(&self, system_instruction: &str, user_prompt: &str) -> Result<String> {
        self.call_llm(system_instruction, user_prompt).await
    }
}

/// Strip a markdown code fence (```json ... ```) if the model wrapped its answer in one.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `sql`, ...) on the opening line
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```sql\nSELECT 1\n```  "), "SELECT 1");
        assert_eq!(strip_code_fence("  SELECT 1 "), "SELECT 1");
    }

    #[test]
    fn test_from_settings_without_key() {
        let settings = Settings::default();
        assert!(LlmClient::from_settings(&settings).unwrap().is_none());
    }
}
