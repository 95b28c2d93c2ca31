use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{http_client, LanguageModel};
use crate::{config::OpenAiSettings, error::GenerationError, models::GenerationOptions};

pub struct OpenAiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(settings: &OpenAiSettings, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![WireMessage { role: "user", content: prompt }],
            max_completion_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
        };

        info!("📤 OpenAI chat request ({}, {} prompt chars)", self.model, prompt.len());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest("openai", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("❌ OpenAI API error ({}): {}", status, error_text);
            return Err(GenerationError::BackendUnavailable(format!("openai: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::from_reqwest("openai", e))?;
        debug!("📥 OpenAI response: {} bytes", body.len());

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::InvalidResponse(format!("openai: parse error: {e}")))?;
        first_choice_text(parsed).ok_or_else(|| GenerationError::InvalidResponse("openai: empty completion".into()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_completion_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice_text(resp: ChatResponse) -> Option<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_shape() {
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![WireMessage { role: "user", content: "hi" }],
            max_completion_tokens: 10,
            temperature: 0.5,
            top_p: 1.0,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["max_completion_tokens"], 10);
    }

    #[test]
    fn first_choice_content_is_used() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":" <p>hi</p> "}}]}"#).unwrap();
        assert_eq!(first_choice_text(parsed).as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn null_or_missing_content_is_none() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#).unwrap();
        assert_eq!(first_choice_text(parsed), None);
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(first_choice_text(parsed), None);
    }
}
