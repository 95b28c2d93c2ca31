use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use super::{http_client, LanguageModel};
use crate::{config::GeminiSettings, error::GenerationError, models::GenerationOptions};

pub struct GeminiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiModel {
    pub fn new(settings: &GeminiSettings, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.text_model.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let payload = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "temperature": options.temperature,
                "topP": options.top_p,
                "maxOutputTokens": options.max_tokens
            }
        });

        info!("📤 Gemini text request ({}, {} prompt chars)", self.model, prompt.len());

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest("gemini", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::from_reqwest("gemini", e))?;

        if !status.is_success() {
            error!("❌ Gemini text generation failed with status {}: {}", status, body);
            return Err(GenerationError::BackendUnavailable(format!("gemini: HTTP {status}")));
        }

        debug!("📥 Gemini response: {} bytes", body.len());
        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::InvalidResponse(format!("gemini: parse error: {e}")))?;
        extract_text(&parsed).ok_or_else(|| GenerationError::InvalidResponse("gemini: no text content in response".into()))
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Content,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
    #[allow(dead_code)]
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
pub(crate) struct InlineData {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Concatenated text parts of the first candidate; `None` when blank.
pub(crate) fn extract_text(resp: &GeminiResponse) -> Option<String> {
    let candidate = resp.candidates.first()?;
    let text: String = candidate
        .content
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_parts_are_concatenated() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"<html>"},{"text":"</html>\n"}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_text(&parsed).as_deref(), Some("<html></html>"));
    }

    #[test]
    fn empty_or_missing_text_is_none() {
        let parsed: GeminiResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(extract_text(&parsed), None);
        let parsed: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#).unwrap();
        assert_eq!(extract_text(&parsed), None);
        let parsed: GeminiResponse = serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(extract_text(&parsed), None);
    }
}
