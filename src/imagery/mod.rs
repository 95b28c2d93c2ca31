//! On-demand imagery: fingerprinting, the content-addressed cache, the provider
//! backends and the scenario-tinted placeholder used when generation fails.

mod cache;
mod gemini;
mod openai;
mod placeholder;

pub use cache::{CachedImage, ImageCache};
pub use gemini::GeminiImageBackend;
pub use openai::OpenAiImageBackend;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::{
    config::{Config, Provider},
    error::{ConfigError, GenerationError},
};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
    Svg,
}

impl ImageFormat {
    /// Formats a backend can produce, in cache lookup order.
    pub const CACHEABLE: [ImageFormat; 4] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Webp, ImageFormat::Gif];

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Gif => "gif",
            ImageFormat::Svg => "svg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Svg => "image/svg+xml",
        }
    }

    /// Detects the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes) {
            Ok(image::ImageFormat::Png) => Some(ImageFormat::Png),
            Ok(image::ImageFormat::Jpeg) => Some(ImageFormat::Jpeg),
            Ok(image::ImageFormat::WebP) => Some(ImageFormat::Webp),
            Ok(image::ImageFormat::Gif) => Some(ImageFormat::Gif),
            _ => None,
        }
    }
}

/// Cache key for one (scenario, description) pair: lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(scenario_id: &str, description: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scenario_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_description(description).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accepts only well-formed fingerprints, so they are safe to use as file names.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_description(description: &str) -> String {
    description
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `"ancient-mystic-portal.jpg"` becomes `"ancient mystic portal"`.
pub fn description_from_filename(name: &str) -> String {
    let name = name.rsplit('/').next().unwrap_or(name);
    let name = name.split(['?', '#']).next().unwrap_or(name);
    let stem = match name.rsplit_once('.') {
        Some((stem, ext)) if IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => stem,
        _ => name,
    };
    let decoded = urlencoding::decode(stem).map(|s| s.into_owned()).unwrap_or_else(|_| stem.to_string());
    normalize_description(&decoded)
}

pub fn has_image_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Route that serves the image for `description` under `scenario_id`.
pub fn image_url(scenario_id: &str, description: &str) -> String {
    let fingerprint = Fingerprint::compute(scenario_id, description);
    format!(
        "/_image/{}/{}?description={}",
        scenario_id,
        fingerprint,
        urlencoding::encode(&normalize_description(description))
    )
}

pub fn build_image_prompt(description: &str) -> String {
    let subject = if description.len() < 10 {
        format!("Detailed illustration of {description}")
    } else {
        description.to_string()
    };
    format!("{subject}, high quality, detailed")
}

/// Image generation, independent of the provider behind it.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, GenerationError>;

    fn name(&self) -> &'static str;
}

pub fn backend_from_config(config: &Config) -> Result<Arc<dyn ImageBackend>, ConfigError> {
    match config.image_backend {
        Provider::Gemini => {
            let settings = config
                .gemini
                .as_ref()
                .ok_or(ConfigError::MissingCredential { var: "GEMINI_API_KEY", backend: "gemini" })?;
            Ok(Arc::new(GeminiImageBackend::new(settings, config.backend_timeout)))
        }
        Provider::OpenAi => {
            let settings = config
                .openai
                .as_ref()
                .ok_or(ConfigError::MissingCredential { var: "OPENAI_API_KEY", backend: "openai" })?;
            Ok(Arc::new(OpenAiImageBackend::new(settings, config.backend_timeout)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Cache,
    Backend,
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub source: ImageSource,
}

impl ImageAsset {
    fn from_cached(cached: CachedImage, source: ImageSource) -> Self {
        Self { bytes: cached.bytes, format: cached.format, source }
    }
}

pub struct ImageGenerator {
    backend: Arc<dyn ImageBackend>,
    cache: ImageCache,
}

impl ImageGenerator {
    pub fn new(backend: Arc<dyn ImageBackend>, cache: ImageCache) -> Self {
        Self { backend, cache }
    }

    /// Cache-first lookup; on a miss the backend is called and the result stored.
    /// Never fails: any backend problem yields the scenario placeholder.
    pub async fn get_image(&self, scenario_id: &str, description: &str) -> ImageAsset {
        let normalized = normalize_description(description);
        if normalized.is_empty() {
            warn!("Empty image description for scenario '{}'", scenario_id);
            return Self::placeholder(scenario_id);
        }
        let fingerprint = Fingerprint::compute(scenario_id, &normalized);

        if let Some(asset) = self.cached(scenario_id, &fingerprint).await {
            info!("🗂️ Using cached image {} for '{}'", fingerprint, normalized);
            return asset;
        }

        let prompt = build_image_prompt(&normalized);
        info!("🖼️ Generating image via {} for '{}'", self.backend.name(), normalized);
        let bytes = match self.backend.generate(&prompt).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("❌ Image generation failed for '{}': {}", normalized, e);
                return Self::placeholder(scenario_id);
            }
        };

        let Some(format) = ImageFormat::sniff(&bytes) else {
            error!("❌ Image backend returned {} bytes of unrecognised data", bytes.len());
            return Self::placeholder(scenario_id);
        };

        let bytes = Bytes::from(bytes);
        match self.cache.put(scenario_id, &fingerprint, bytes.clone(), format).await {
            Ok(stored) => ImageAsset::from_cached(stored, ImageSource::Backend),
            Err(e) => {
                warn!("Could not cache image {}: {}", fingerprint, e);
                ImageAsset { bytes, format, source: ImageSource::Backend }
            }
        }
    }

    pub async fn cached(&self, scenario_id: &str, fingerprint: &Fingerprint) -> Option<ImageAsset> {
        match self.cache.get(scenario_id, fingerprint).await {
            Ok(hit) => hit.map(|c| ImageAsset::from_cached(c, ImageSource::Cache)),
            Err(e) => {
                warn!("Image cache read failed for {}: {}", fingerprint, e);
                None
            }
        }
    }

    pub fn placeholder(scenario_id: &str) -> ImageAsset {
        ImageAsset {
            bytes: Bytes::from(placeholder::render(scenario_id)),
            format: ImageFormat::Svg,
            source: ImageSource::Placeholder,
        }
    }
}
