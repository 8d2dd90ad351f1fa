use async_trait::async_trait;
use concord_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::build_http_client;
use crate::Generator;

const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

pub struct OllamaGenerator {
    client: Client,
    api_base: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(api_base: Option<&str>, model: &str) -> Self {
        Self::new_with_proxy(api_base, model, None)
    }

    pub fn new_with_proxy(api_base: Option<&str>, model: &str, provider_proxy: Option<&str>) -> Self {
        let resolved_base = api_base
            .unwrap_or(DEFAULT_OLLAMA_BASE)
            .trim_end_matches('/')
            .to_string();
        // local inference is slow
        let client = build_http_client(provider_proxy, &resolved_base, Duration::from_secs(300));
        Self {
            client,
            api_base: resolved_base,
            model: model.to_string(),
        }
    }

    /// Strips the `ollama/` routing prefix.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("ollama/").unwrap_or(model)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

fn parse_chat_response(raw_body: &str) -> Result<String> {
    let resp: OllamaChatResponse = serde_json::from_str(raw_body)
        .map_err(|e| Error::Provider(format!("Failed to parse Ollama response: {}", e)))?;
    debug!(eval_count = ?resp.eval_count, "Ollama response parsed");
    if resp.message.content.trim().is_empty() {
        return Err(Error::Provider("Empty Ollama completion".to_string()));
    }
    Ok(resp.message.content)
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/api/chat", self.api_base);
        let model = Self::normalize_model(&self.model);

        let request = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            }
        });

        info!(url = %url, model = %model, "Calling Ollama");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Error::Provider(format!("Ollama API error {}: {}", status, raw_body)));
        }

        parse_chat_response(&raw_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(OllamaGenerator::normalize_model("ollama/llama3"), "llama3");
        assert_eq!(OllamaGenerator::normalize_model("qwen2.5"), "qwen2.5");
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "model": "llama3",
            "message": {
                "role": "assistant",
                "content": "Hello! How can I help?"
            },
            "done": true,
            "prompt_eval_count": 50,
            "eval_count": 20
        }"#;
        assert_eq!(parse_chat_response(json).unwrap(), "Hello! How can I help?");
    }

    #[test]
    fn test_parse_empty_response() {
        let json = r#"{"message": {"role": "assistant", "content": "  "}, "done": true}"#;
        assert!(parse_chat_response(json).is_err());
    }
}
