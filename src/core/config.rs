//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::models::RequestDefaults;

/// Configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend base URL; `None` selects the stub backend
    pub llm_base_url: Option<String>,
    pub api_key: String,
    pub timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub default_model: String,
    pub default_max_tokens: u32,
    pub default_temperature: f64,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    /// Per-client limit applied by the HTTP layer, keyed on user or IP
    pub client_rate_limit_rps: f64,
    pub client_rate_limit_burst: u32,
    pub daily_token_limit: u64,
    /// Disabled bus selects the no-op fan-out
    pub pubsub_enabled: bool,
    pub pubsub_capacity: usize,
    pub stub_word_delay_ms: u64,
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let defaults = RequestDefaults::default();
        Self {
            llm_base_url: None,
            api_key: String::new(),
            timeout_ms: 30000,
            health_timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
            default_model: defaults.model,
            default_max_tokens: defaults.max_tokens,
            default_temperature: defaults.temperature,
            rate_limit_rps: 1.0,
            rate_limit_burst: 5,
            client_rate_limit_rps: 10.0,
            client_rate_limit_burst: 20,
            daily_token_limit: 100_000,
            pubsub_enabled: true,
            pubsub_capacity: 256,
            stub_word_delay_ms: 50,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Parse `key` from the lookup, falling back to `default` when unset or empty
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let llm_base_url = lookup("LLM_BASE_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let config = Self {
            llm_base_url,
            api_key: lookup("LLM_API_KEY").unwrap_or_default(),
            timeout_ms: parse_or(&lookup, "REQUEST_TIMEOUT_MS", defaults.timeout_ms)?,
            health_timeout_ms: parse_or(&lookup, "HEALTH_TIMEOUT_MS", defaults.health_timeout_ms)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: parse_or(&lookup, "RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            default_model: lookup("DEFAULT_MODEL")
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.default_model),
            default_max_tokens: parse_or(&lookup, "DEFAULT_MAX_TOKENS", defaults.default_max_tokens)?,
            default_temperature: parse_or(&lookup, "DEFAULT_TEMPERATURE", defaults.default_temperature)?,
            rate_limit_rps: parse_or(&lookup, "RATE_LIMIT_RPS", defaults.rate_limit_rps)?,
            rate_limit_burst: parse_or(&lookup, "RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            client_rate_limit_rps: parse_or(&lookup, "CLIENT_RATE_LIMIT_RPS", defaults.client_rate_limit_rps)?,
            client_rate_limit_burst: parse_or(
                &lookup,
                "CLIENT_RATE_LIMIT_BURST",
                defaults.client_rate_limit_burst,
            )?,
            daily_token_limit: parse_or(&lookup, "DAILY_TOKEN_LIMIT", defaults.daily_token_limit)?,
            pubsub_enabled: parse_or(&lookup, "PUBSUB_ENABLED", defaults.pubsub_enabled)?,
            pubsub_capacity: parse_or(&lookup, "PUBSUB_CAPACITY", defaults.pubsub_capacity)?,
            stub_word_delay_ms: parse_or(&lookup, "STUB_WORD_DELAY_MS", defaults.stub_word_delay_ms)?,
            host: lookup("SERVER_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.host),
            port: parse_or(&lookup, "SERVER_PORT", defaults.port)?,
        };

        Ok(config)
    }

    /// Load from a YAML file when given, otherwise from the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            None => Self::from_env(),
        }
    }

    /// Apply command line overrides for the backend
    pub fn override_backend(&mut self, base_url: Option<&str>, api_key: Option<&str>) {
        if let Some(base_url) = base_url {
            let trimmed = base_url.trim().trim_end_matches('/');
            self.llm_base_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Some(api_key) = api_key {
            self.api_key = api_key.to_string();
        }
    }

    /// Load from YAML (or JSON) file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(url) = &self.llm_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!("LLM base URL must be http(s): {}", url));
            }
            if self.api_key.is_empty() {
                warn!("No API key configured for LLM backend");
            }
        }

        if self.rate_limit_rps <= 0.0 || !self.rate_limit_rps.is_finite() {
            return Err(anyhow::anyhow!("rate_limit_rps must be greater than 0"));
        }

        if self.rate_limit_burst == 0 {
            return Err(anyhow::anyhow!("rate_limit_burst must be greater than 0"));
        }

        if self.client_rate_limit_rps <= 0.0 || !self.client_rate_limit_rps.is_finite() {
            return Err(anyhow::anyhow!("client_rate_limit_rps must be greater than 0"));
        }

        if self.client_rate_limit_burst == 0 {
            return Err(anyhow::anyhow!("client_rate_limit_burst must be greater than 0"));
        }

        if self.daily_token_limit == 0 {
            return Err(anyhow::anyhow!("daily_token_limit must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(anyhow::anyhow!("default_temperature must be within [0, 2]"));
        }

        if !(1..=4096).contains(&self.default_max_tokens) {
            return Err(anyhow::anyhow!("default_max_tokens must be within [1, 4096]"));
        }

        if self.pubsub_capacity == 0 {
            return Err(anyhow::anyhow!("pubsub_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Whether the stub backend will be selected
    pub fn is_stub_mode(&self) -> bool {
        self.llm_base_url.is_none()
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            model: self.default_model.clone(),
            max_tokens: self.default_max_tokens,
            temperature: self.default_temperature,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stub_word_delay(&self) -> Duration {
        Duration::from_millis(self.stub_word_delay_ms)
    }
}
