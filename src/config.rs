use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{chat::HistoryBudget, error::ConfigError, models::GenerationOptions};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    OpenAi,
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub text_backend: Provider,
    pub image_backend: Provider,
    pub gemini: Option<GeminiSettings>,
    pub openai: Option<OpenAiSettings>,
    pub scenario_dir: PathBuf,
    pub default_scenario: String,
    pub image_cache_dir: PathBuf,
    pub image_cache_max_entries: Option<usize>,
    pub chat_budget: HistoryBudget,
    pub chat_max_sessions: usize,
    /// Bounds the pages remembered as browsing context; `max_turns` counts pages.
    pub browse_budget: HistoryBudget,
    pub backend_timeout: Duration,
    pub page_options: GenerationOptions,
    pub chat_options: GenerationOptions,
}

impl Config {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let text_backend = parse_or(&get, "LM_BACKEND", Provider::Gemini)?;
        let image_backend = parse_or(&get, "IMAGE_BACKEND", Provider::Gemini)?;
        let uses = |p: Provider| text_backend == p || image_backend == p;

        let gemini = match get("GEMINI_API_KEY") {
            Some(api_key) => Some(GeminiSettings {
                api_key,
                base_url: get("GEMINI_API_BASE").unwrap_or_else(|| GEMINI_API_BASE.to_string()),
                text_model: get("GEMINI_TEXT_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
                image_model: get("GEMINI_IMAGE_MODEL")
                    .unwrap_or_else(|| "gemini-2.5-flash-image-preview".to_string()),
            }),
            None if uses(Provider::Gemini) => {
                return Err(ConfigError::MissingCredential { var: "GEMINI_API_KEY", backend: "gemini" })
            }
            None => None,
        };

        let openai = match get("OPENAI_API_KEY") {
            Some(api_key) => Some(OpenAiSettings {
                api_key,
                base_url: get("OPENAI_API_BASE").unwrap_or_else(|| OPENAI_API_BASE.to_string()),
                model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                image_model: get("OPENAI_IMAGE_MODEL").unwrap_or_else(|| "dall-e-3".to_string()),
            }),
            None if uses(Provider::OpenAi) => {
                return Err(ConfigError::MissingCredential { var: "OPENAI_API_KEY", backend: "openai" })
            }
            None => None,
        };

        let image_cache_max_entries = match get("IMAGE_CACHE_MAX_ENTRIES") {
            Some(raw) => Some(parse_value("IMAGE_CACHE_MAX_ENTRIES", &raw)?),
            None => None,
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 8080)?,
            text_backend,
            image_backend,
            gemini,
            openai,
            scenario_dir: get("SCENARIO_DIR").map(PathBuf::from).unwrap_or_else(|| "data/scenarios".into()),
            default_scenario: get("DEFAULT_SCENARIO").unwrap_or_else(|| "etherweave".to_string()),
            image_cache_dir: get("IMAGE_CACHE_DIR").map(PathBuf::from).unwrap_or_else(|| "data/image_cache".into()),
            image_cache_max_entries,
            chat_budget: HistoryBudget {
                max_turns: parse_or(&get, "CHAT_HISTORY_MAX_TURNS", 12)?,
                max_chars: parse_or(&get, "CHAT_HISTORY_MAX_CHARS", 8000)?,
            },
            chat_max_sessions: parse_or(&get, "CHAT_MAX_SESSIONS", 1000)?,
            browse_budget: HistoryBudget {
                max_turns: parse_or(&get, "BROWSE_HISTORY_MAX_PAGES", 6)?,
                max_chars: parse_or(&get, "BROWSE_HISTORY_MAX_CHARS", 6000)?,
            },
            backend_timeout: Duration::from_secs(parse_or(&get, "BACKEND_TIMEOUT_SECS", 180)?),
            page_options: GenerationOptions {
                max_tokens: parse_or(&get, "PAGE_MAX_TOKENS", 8192)?,
                temperature: parse_or(&get, "PAGE_TEMPERATURE", 1.0)?,
                top_p: 1.0,
            },
            chat_options: GenerationOptions { max_tokens: 1024, temperature: 0.8, top_p: 0.95 },
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value: raw.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn missing_key_for_selected_backend_is_fatal() {
        let err = config_from(&[]).unwrap_err();
        assert_eq!(err, ConfigError::MissingCredential { var: "GEMINI_API_KEY", backend: "gemini" });

        let err = config_from(&[("LM_BACKEND", "openai"), ("GEMINI_API_KEY", "g")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingCredential { var: "OPENAI_API_KEY", backend: "openai" });
    }

    #[test]
    fn unselected_backend_needs_no_key() {
        let config = config_from(&[
            ("LM_BACKEND", "openai"),
            ("IMAGE_BACKEND", "OpenAI"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(config.text_backend, Provider::OpenAi);
        assert_eq!(config.image_backend, Provider::OpenAi);
        assert!(config.gemini.is_none());
        assert_eq!(config.openai.unwrap().base_url, OPENAI_API_BASE);
    }

    #[test]
    fn defaults_and_overrides() {
        let config = config_from(&[
            ("GEMINI_API_KEY", "g"),
            ("PORT", "9000"),
            ("CHAT_HISTORY_MAX_TURNS", "4"),
            ("IMAGE_CACHE_MAX_ENTRIES", "50"),
            ("CHAT_MAX_SESSIONS", "25"),
            ("BROWSE_HISTORY_MAX_PAGES", "3"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.chat_budget.max_turns, 4);
        assert_eq!(config.chat_budget.max_chars, 8000);
        assert_eq!(config.image_cache_max_entries, Some(50));
        assert_eq!(config.chat_max_sessions, 25);
        assert_eq!(config.browse_budget, HistoryBudget { max_turns: 3, max_chars: 6000 });
        assert_eq!(config.default_scenario, "etherweave");
        assert_eq!(config.backend_timeout, Duration::from_secs(180));
    }

    #[test]
    fn garbage_values_are_rejected() {
        let err = config_from(&[("GEMINI_API_KEY", "g"), ("PORT", "eighty")]).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { var: "PORT", value: "eighty".into() });

        let err = config_from(&[("GEMINI_API_KEY", "g"), ("LM_BACKEND", "cerebras")]).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { var: "LM_BACKEND", value: "cerebras".into() });
    }
}
