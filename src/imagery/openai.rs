use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::ImageBackend;
use crate::{config::OpenAiSettings, error::GenerationError, llm::http_client};

pub struct OpenAiImageBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiImageBackend {
    pub fn new(settings: &OpenAiSettings, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.image_model.clone(),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest("openai-image", e))?;
        if !response.status().is_success() {
            return Err(GenerationError::BackendUnavailable(format!(
                "openai-image: download failed with HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GenerationError::from_reqwest("openai-image", e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageBackend for OpenAiImageBackend {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, GenerationError> {
        let url = format!("{}/images/generations", self.base_url);
        let request = ImageRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: "1024x1024",
            response_format: "b64_json",
        };

        info!("🔗 OpenAI image request ({})", self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest("openai-image", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("❌ OpenAI image API error ({}): {}", status, error_text);
            return Err(GenerationError::BackendUnavailable(format!("openai-image: HTTP {status}")));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(format!("openai-image: {e}")))?;

        match parsed.data.into_iter().next() {
            Some(ImageData { b64_json: Some(encoded), .. }) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| GenerationError::InvalidResponse(format!("openai-image: bad base64: {e}"))),
            Some(ImageData { url: Some(url), .. }) => self.download(&url).await,
            _ => Err(GenerationError::InvalidResponse("openai-image: no image in response".into())),
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_variants_parse() {
        let parsed: ImageResponse = serde_json::from_str(r#"{"created":1,"data":[{"b64_json":"AAAA"}]}"#).unwrap();
        assert_eq!(parsed.data[0].b64_json.as_deref(), Some("AAAA"));

        let parsed: ImageResponse =
            serde_json::from_str(r#"{"data":[{"url":"https://example.test/a.png","revised_prompt":"x"}]}"#).unwrap();
        assert_eq!(parsed.data[0].url.as_deref(), Some("https://example.test/a.png"));
        assert!(parsed.data[0].b64_json.is_none());
    }
}
