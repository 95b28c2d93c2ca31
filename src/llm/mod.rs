//! Language-model capability and its provider backends.

pub(crate) mod gemini;
mod openai;

pub use gemini::GeminiModel;
pub use openai::OpenAiModel;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    config::{Config, Provider},
    error::{ConfigError, GenerationError},
    models::GenerationOptions,
};

/// Text generation, independent of the provider behind it.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, GenerationError>;

    fn name(&self) -> &'static str;
}

/// Picks the text backend named in the configuration.
pub fn from_config(config: &Config) -> Result<Arc<dyn LanguageModel>, ConfigError> {
    match config.text_backend {
        Provider::Gemini => {
            let settings = config
                .gemini
                .as_ref()
                .ok_or(ConfigError::MissingCredential { var: "GEMINI_API_KEY", backend: "gemini" })?;
            Ok(Arc::new(GeminiModel::new(settings, config.backend_timeout)))
        }
        Provider::OpenAi => {
            let settings = config
                .openai
                .as_ref()
                .ok_or(ConfigError::MissingCredential { var: "OPENAI_API_KEY", backend: "openai" })?;
            Ok(Arc::new(OpenAiModel::new(settings, config.backend_timeout)))
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Scripted model that records every prompt it receives.
    #[derive(Default)]
    pub struct StubModel {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        fallback: Option<String>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl StubModel {
        pub fn replying(text: impl Into<String>) -> Self {
            Self { fallback: Some(text.into()), ..Default::default() }
        }

        pub fn failing() -> Self {
            Self::default()
        }

        pub fn push(&self, reply: Result<String, GenerationError>) {
            self.replies.lock().push_back(reply);
        }

        pub fn last_prompt(&self) -> String {
            self.prompts.lock().last().cloned().unwrap_or_default()
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    #[async_trait]
    impl LanguageModel for StubModel {
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<String, GenerationError> {
            self.prompts.lock().push(prompt.to_string());
            if let Some(reply) = self.replies.lock().pop_front() {
                return reply;
            }
            match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(GenerationError::BackendUnavailable("stub offline".into())),
            }
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }
}
