use async_trait::async_trait;
use concord_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, truncate_at_char_boundary};
use crate::Generator;

/// Generator for any OpenAI-compatible `/chat/completions` endpoint
/// (openai, openrouter, deepseek, groq and self-hosted relays).
pub struct OpenAIGenerator {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAIGenerator {
    pub fn new(api_key: &str, api_base: Option<&str>, model: &str) -> Self {
        Self::new_with_proxy(api_key, api_base, model, None)
    }

    pub fn new_with_proxy(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        provider_proxy: Option<&str>,
    ) -> Self {
        let resolved_base = api_base
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        let client = build_http_client(provider_proxy, &resolved_base, Duration::from_secs(120));
        Self {
            client,
            api_key: api_key.to_string(),
            api_base: resolved_base,
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn parse_chat_response(raw_body: &str) -> Result<String> {
    let chat_response: ChatResponse = serde_json::from_str(raw_body).map_err(|e| {
        let end = truncate_at_char_boundary(raw_body, 500);
        Error::Provider(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
    })?;

    let choice = chat_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

    choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| Error::Provider("Empty completion".to_string()))
}

#[async_trait]
impl Generator for OpenAIGenerator {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
            max_tokens,
            temperature,
        };

        info!(url = %url, model = %self.model, max_tokens, "Calling LLM");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "LLM API error");
            return Err(Error::Provider(format!("API error {}: {}", status, raw_body)));
        }

        debug!(body_len = raw_body.len(), "LLM raw response");
        parse_chat_response(&raw_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Hello there"},"finish_reason":"stop"}],"usage":{"total_tokens":3}}"#;
        assert_eq!(parse_chat_response(raw).unwrap(), "Hello there");
    }

    #[test]
    fn test_parse_chat_response_no_choices() {
        let raw = r#"{"choices":[]}"#;
        assert!(matches!(parse_chat_response(raw), Err(Error::Provider(_))));
    }

    #[test]
    fn test_parse_chat_response_empty_content() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        assert!(parse_chat_response(raw).is_err());
        assert!(parse_chat_response("not json").is_err());
    }

    #[test]
    fn test_base_is_normalized() {
        let g = OpenAIGenerator::new("k", Some("https://api.deepseek.com/v1/"), "deepseek-chat");
        assert_eq!(g.api_base, "https://api.deepseek.com/v1");
        assert_eq!(g.model(), "deepseek-chat");
    }
}
