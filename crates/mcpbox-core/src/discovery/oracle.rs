//! Bootstrap oracle: the opaque text-to-text generator that writes setup
//! scripts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::OracleSettings;
use crate::errors::DiscoveryError;

#[async_trait]
pub trait BootstrapOracle: Send + Sync {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, DiscoveryError>;
}

/// Oracle backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiOracle {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: "https://api.openai.com/v1".to_string(),
            model,
            temperature: None,
        }
    }

    pub fn from_settings(settings: &OracleSettings) -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| DiscoveryError::Oracle(format!("Failed to build HTTP client: {}", e)))?;

        let mut oracle = Self::new(
            settings.api_key.clone().unwrap_or_default(),
            settings.model.clone(),
        )
        .with_api_base(settings.api_base.clone());
        oracle.client = client;
        if let Some(temperature) = settings.temperature {
            oracle = oracle.with_temperature(temperature);
        }
        Ok(oracle)
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn build_request_body(&self, system_prompt: &str, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": prompt},
            ],
        });

        if let Some(temp) = self.temperature {
            body["temperature"] = temp.into();
        }

        body
    }

    fn parse_response(response: &Value) -> Result<String, DiscoveryError> {
        let choices = response["choices"]
            .as_array()
            .ok_or_else(|| DiscoveryError::Oracle("No choices in response".to_string()))?;

        let choice = choices
            .first()
            .ok_or_else(|| DiscoveryError::Oracle("Empty choices array".to_string()))?;

        choice["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| DiscoveryError::Oracle("Response carries no message content".to_string()))
    }
}

#[async_trait]
impl BootstrapOracle for OpenAiOracle {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, DiscoveryError> {
        if self.api_key.is_empty() {
            return Err(DiscoveryError::Oracle(
                "No API key configured for the bootstrap oracle".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request_body(system_prompt, prompt);
        log::debug!("Oracle request to {} (model {})", url, self.model);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Oracle(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| DiscoveryError::Oracle(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(DiscoveryError::Oracle(format!(
                "API request failed with status {}: {}",
                status, response_text
            )));
        }

        let response_json: Value = serde_json::from_str(&response_text)
            .map_err(|e| DiscoveryError::Oracle(format!("Invalid JSON response: {}", e)))?;

        Self::parse_response(&response_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_both_prompts() {
        let oracle = OpenAiOracle::new("key".to_string(), "gpt-4o".to_string()).with_temperature(0.2);
        let body = oracle.build_request_body("system", "user");

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parses_first_choice_content() {
        let response = json!({"choices": [{"message": {"role": "assistant", "content": "#!/bin/bash"}}]});
        assert_eq!(OpenAiOracle::parse_response(&response).unwrap(), "#!/bin/bash");
    }

    #[test]
    fn empty_choices_is_an_oracle_error() {
        let response = json!({"choices": []});
        assert!(matches!(
            OpenAiOracle::parse_response(&response),
            Err(DiscoveryError::Oracle(_))
        ));
    }

    #[tokio::test]
    async fn missing_api_key_fails_without_a_request() {
        let oracle = OpenAiOracle::new(String::new(), "gpt-4o".to_string())
            .with_api_base("http://127.0.0.1:9".to_string());
        let err = oracle.generate("s", "p").await.unwrap_err();
        assert!(err.to_string().contains("No API key"));
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let oracle = OpenAiOracle::new("k".to_string(), "m".to_string())
            .with_api_base("http://localhost:1234/v1/".to_string());
        assert_eq!(oracle.api_base, "http://localhost:1234/v1");
    }
}
