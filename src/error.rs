use thiserror::Error;

/// Failures on the generation path. Both variants are recovered locally
/// (fallback page, placeholder image, degraded chat reply).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    pub fn from_reqwest(backend: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::BackendUnavailable(format!("{backend}: request timed out"))
        } else if err.is_decode() {
            GenerationError::InvalidResponse(format!("{backend}: {err}"))
        } else {
            GenerationError::BackendUnavailable(format!("{backend}: {err}"))
        }
    }
}

/// Admin-facing scenario store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scenario not found: {0}")]
    NotFound(String),
    #[error("scenario already exists: {0}")]
    Conflict(String),
    #[error("invalid scenario: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scenario id not usable as a cache directory: {0:?}")]
    InvalidScenario(String),
}

/// Startup-time configuration errors; all of them are fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be set when the {backend} backend is selected")]
    MissingCredential { var: &'static str, backend: &'static str },
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
