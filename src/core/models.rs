//! Core data models for generation

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::{GatewayError, Result};

/// Prompt length accepted by validation
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Model name recorded when no chunk names one
pub const UNKNOWN_MODEL: &str = "unknown-model";

/// Rough token estimate: ~4 bytes per token
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Defaults applied to optional request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// Generation request as accepted by the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Fail closed on empty identity/prompt or out-of-range numbers
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(GatewayError::validation("prompt must not be empty"));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(GatewayError::validation(format!(
                "prompt exceeds {} characters",
                MAX_PROMPT_CHARS
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(GatewayError::validation("user id is required"));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(GatewayError::validation(format!(
                    "temperature {} outside [0, 2]",
                    temperature
                )));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if !(1..=4096).contains(&max_tokens) {
                return Err(GatewayError::validation(format!(
                    "max_tokens {} outside [1, 4096]",
                    max_tokens
                )));
            }
        }
        Ok(())
    }

    /// Project id, treating an empty string as absent
    pub fn project(&self) -> Option<&str> {
        self.project_id.as_deref().filter(|p| !p.is_empty())
    }

    /// Prompt with the hint lines prepended
    pub fn build_prompt(&self) -> String {
        let hints: Vec<String> = [
            ("Language", &self.language),
            ("Framework", &self.framework),
            ("Style", &self.style),
            ("Complexity", &self.complexity),
        ]
        .iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}: {}", label, v))
        })
        .collect();

        if hints.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}\n\n{}", hints.join("\n"), self.prompt)
        }
    }

    /// Backend request with defaults filled in
    pub fn to_completion(&self, defaults: &RequestDefaults, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| defaults.model.clone()),
            prompt: self.build_prompt(),
            max_tokens: Some(self.max_tokens.unwrap_or(defaults.max_tokens)),
            temperature: Some(self.temperature.unwrap_or(defaults.temperature)),
            stream,
        }
    }
}

/// Completion request sent to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Incremental content of a streamed choice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A single choice in a backend response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Backend-agnostic response, full or one streamed chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl GenerationResponse {
    /// Text of the first choice, delta first
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| {
                c.delta
                    .as_ref()
                    .and_then(|d| d.content.as_deref())
                    .or(c.text.as_deref())
            })
            .unwrap_or("")
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }

    /// Reported total, or an estimate of the output
    pub fn used_tokens(&self) -> u64 {
        match self.usage {
            Some(usage) if usage.total_tokens > 0 => usage.total_tokens,
            _ => estimate_tokens(self.content()),
        }
    }
}

/// One fragment of a generation as seen by the orchestrator
#[derive(Debug, Default)]
pub struct StreamChunk {
    pub content: String,
    pub token_count: u64,
    pub is_complete: bool,
    pub model: Option<String>,
    pub error: Option<GatewayError>,
}

impl StreamChunk {
    /// Map a backend chunk into the common shape
    pub fn from_response(response: &GenerationResponse) -> Self {
        let content = response.content().to_string();
        let token_count = if content.is_empty() {
            0
        } else {
            estimate_tokens(&content).max(1)
        };
        Self {
            content,
            token_count,
            is_complete: response.finish_reason().is_some(),
            model: Some(response.model.clone()).filter(|m| !m.is_empty()),
            error: None,
        }
    }

    /// Terminal chunk carrying an error
    pub fn failed(error: GatewayError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Kind of a caller-visible stream event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Chunk,
    Complete,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Chunk => write!(f, "chunk"),
            EventKind::Complete => write!(f, "complete"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

/// Event emitted by the orchestrator towards the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>, token_count: u64, is_complete: bool) -> Self {
        Self {
            id: None,
            kind: EventKind::Chunk,
            content: content.into(),
            token_count,
            is_complete,
            model: None,
            error: None,
            code: None,
        }
    }

    pub fn complete(total_tokens: u64, model: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: EventKind::Complete,
            content: String::new(),
            token_count: total_tokens,
            is_complete: true,
            model: Some(model.into()),
            error: None,
            code: None,
        }
    }

    pub fn error(err: &GatewayError) -> Self {
        Self {
            id: None,
            kind: EventKind::Error,
            content: String::new(),
            token_count: 0,
            is_complete: false,
            model: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Whether the transport must close after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }
}

/// Persisted record of one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationHistory {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub prompt: String,
    pub content: String,
    pub model: String,
    pub tokens: u64,
    /// False when the caller disconnected before completion
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a user's daily quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: String,
    pub daily_limit: u64,
    pub used_today: u64,
    pub remaining: u64,
    pub last_reset_day: NaiveDate,
}

impl QuotaStatus {
    pub fn new(user_id: impl Into<String>, daily_limit: u64, used_today: u64, day: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            daily_limit,
            used_today,
            remaining: daily_limit.saturating_sub(used_today),
            last_reset_day: day,
        }
    }

    pub fn can_generate(&self) -> bool {
        self.remaining > 0
    }

    /// Midnight UTC after the last reset day
    pub fn reset_time(&self) -> DateTime<Utc> {
        (self.last_reset_day + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now)
    }
}

/// Catalog entry for a backend model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: String,
    pub provider: String,
    pub max_tokens: u32,
    pub created_at: DateTime<Utc>,
}
