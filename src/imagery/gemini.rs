use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info};

use super::ImageBackend;
use crate::{
    config::GeminiSettings,
    error::GenerationError,
    llm::{
        gemini::{GeminiResponse, Part},
        http_client,
    },
};

pub struct GeminiImageBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiImageBackend {
    pub fn new(settings: &GeminiSettings, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.image_model.clone(),
        }
    }
}

#[async_trait]
impl ImageBackend for GeminiImageBackend {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request_body = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "temperature": 0.4,
                "topP": 0.95,
                "topK": 64,
                "candidateCount": 1
            }
        });

        info!("🔗 Gemini image request ({})", self.model);

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest("gemini-image", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ Gemini image API error ({}): {}", status, error_body);
            return Err(GenerationError::BackendUnavailable(format!("gemini-image: HTTP {status}")));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| GenerationError::from_reqwest("gemini-image", e))?;
        if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&response_text) {
            truncate_base64_in_json(&mut value);
            debug!("📥 Gemini image response: {}", value);
        }

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| GenerationError::InvalidResponse(format!("gemini-image: parse error: {e}")))?;
        let encoded = extract_first_image_b64(&parsed)
            .ok_or_else(|| GenerationError::InvalidResponse("gemini-image: no image data in response".into()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GenerationError::InvalidResponse(format!("gemini-image: bad base64: {e}")))
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

fn extract_first_image_b64(resp: &GeminiResponse) -> Option<&str> {
    resp.candidates.iter().flat_map(|c| c.content.parts.iter()).find_map(|p| match p {
        Part::Inline { inline_data } => {
            debug!("🎯 Found image data with mime type: {}", inline_data.mime_type);
            Some(inline_data.data.as_str())
        }
        _ => None,
    })
}

/// Shortens long base64 `data` fields so responses stay readable in logs.
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                match val {
                    serde_json::Value::String(s) if key == "data" && s.len() > 100 && is_base64(s) => {
                        *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                    }
                    _ => truncate_base64_in_json(val),
                }
            }
        }
        serde_json::Value::Array(arr) => arr.iter_mut().for_each(truncate_base64_in_json),
        _ => {}
    }
}

/// Base64 is ASCII only, which also makes the byte slice in the log preview safe.
fn is_base64(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn finds_inline_image_after_text_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[
            {"text":"Here is your image"},
            {"inlineData":{"mimeType":"image/png","data":"iVBORw0KGgo="}}
        ]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_first_image_b64(&parsed), Some("iVBORw0KGgo="));
    }

    #[test]
    fn text_only_response_has_no_image() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"I cannot draw that"}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_first_image_b64(&parsed), None);
    }

    #[test]
    fn long_data_fields_are_truncated_for_logging() {
        let mut value = json!({"parts": [{"inlineData": {"data": "A".repeat(400), "mimeType": "image/png"}}]});
        truncate_base64_in_json(&mut value);
        let data = value["parts"][0]["inlineData"]["data"].as_str().unwrap();
        assert!(data.ends_with("[truncated 350 chars]"));
    }

    #[test]
    fn non_base64_data_fields_are_logged_untouched() {
        let text = "€".repeat(60);
        let mut value = json!({"data": text.clone(), "error": {"data": "not base64 at all! ".repeat(10)}});
        truncate_base64_in_json(&mut value);
        assert_eq!(value["data"], json!(text));
        assert_eq!(value["error"]["data"], json!("not base64 at all! ".repeat(10)));
    }
}
