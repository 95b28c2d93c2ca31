use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::markup::MarkupWarning;

const MAX_SEGMENTS: usize = 16;
const MAX_SEGMENT_LEN: usize = 64;

/// A named fictional-internet theme. On disk the fields keep the
/// `name` / `description` / `scenario` keys used by existing scenario files.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Scenario {
    #[serde(rename = "name")]
    pub id: String,
    #[serde(rename = "description")]
    pub short_description: String,
    #[serde(rename = "scenario")]
    pub full_description: String,
}

impl Scenario {
    pub fn new(
        id: impl Into<String>,
        short_description: impl Into<String>,
        full_description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            short_description: short_description.into(),
            full_description: full_description.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_tokens: 4096, temperature: 1.0, top_p: 1.0 }
    }
}

/// Sanitized request path. Empty means the home page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PagePath(Vec<String>);

impl PagePath {
    pub fn home() -> Self {
        Self::default()
    }

    /// Splits a raw (already percent-decoded) path and sanitizes every segment so
    /// it can be echoed into a prompt without carrying quotes, fences or markup.
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('/')
            .filter_map(sanitize_segment)
            .take(MAX_SEGMENTS)
            .collect();
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_home(&self) -> bool {
        self.0.is_empty()
    }

    /// Segments of the containing "directory", used to resolve relative links.
    pub fn parent(&self) -> &[String] {
        match self.0.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }
}

impl fmt::Display for PagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

pub(crate) fn sanitize_segment(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len().min(MAX_SEGMENT_LEN));
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
        if out.len() >= MAX_SEGMENT_LEN {
            break;
        }
    }
    let trimmed = out.trim_matches('-');
    match trimmed {
        "" | "." | ".." => None,
        s => Some(s.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub path: PagePath,
    pub scenario: Scenario,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageOutcome {
    Generated,
    Fallback { reason: String },
}

/// Output of one page synthesis. Repeated requests for the same path are not
/// expected to produce the same body; model output varies run to run.
#[derive(Debug, Clone)]
pub struct GeneratedPage {
    pub path: PagePath,
    pub scenario_id: String,
    pub html: String,
    pub title: Option<String>,
    pub excerpt: String,
    pub links: BTreeSet<String>,
    pub image_descriptions: Vec<String>,
    pub warnings: Vec<MarkupWarning>,
    pub outcome: PageOutcome,
    pub generated_at: DateTime<Utc>,
}

impl GeneratedPage {
    pub fn is_fallback(&self) -> bool {
        matches!(self.outcome, PageOutcome::Fallback { .. })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), at: Utc::now() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into(), at: Utc::now() }
    }
}

// --- HTTP payloads ---

#[derive(Debug, Deserialize)]
pub struct SelectScenarioForm {
    pub scenario_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioForm {
    pub id: String,
    pub short_description: String,
    pub full_description: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeScenarioRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub description: String,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: Uuid,
    pub reply: String,
    pub degraded: bool,
}
