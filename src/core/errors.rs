//! Error types for the generation gateway

use thiserror::Error;

/// Gateway-related errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Request failed structural or semantic validation
    #[error("Invalid request: {message}")]
    Validation {
        message: String,
    },

    /// Per-key token bucket is empty
    #[error("Rate limit exceeded for {key}")]
    RateLimitExceeded {
        key: String,
    },

    /// Daily quota is used up
    #[error("Daily quota exceeded for {user_id} ({used_today}/{daily_limit})")]
    QuotaExceeded {
        user_id: String,
        daily_limit: u64,
        used_today: u64,
    },

    /// Backend unreachable or answering 5xx after every retry
    #[error("Upstream unavailable after {attempts} attempts: {message}")]
    UpstreamUnavailable {
        attempts: u32,
        message: String,
    },

    /// Backend answered with a non-retryable status
    #[error("Upstream error: {status} - {message}")]
    Upstream {
        status: u16,
        message: String,
    },

    /// Backend payload could not be decoded
    #[error("Decode error: {message}")]
    Decode {
        message: String,
    },

    /// The caller went away
    #[error("Client disconnected")]
    ClientDisconnect,

    /// History or quota store failed
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
    },

    /// Pub/sub bus failed
    #[error("Pub/sub error: {message}")]
    PubSub {
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::UpstreamUnavailable { .. } | GatewayError::Http(_) => {
                "upstream_unavailable"
            }
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Decode { .. } | GatewayError::Json(_) => "decode_error",
            GatewayError::ClientDisconnect => "client_disconnect",
            GatewayError::Persistence { .. } => "persistence_error",
            GatewayError::PubSub { .. } => "pubsub_error",
            GatewayError::Config { .. } | GatewayError::Yaml(_) => "config_error",
            GatewayError::Internal(_) | GatewayError::Io(_) => "internal_error",
        }
    }

    /// Whether the error was raised before any backend call was made
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation { .. }
                | GatewayError::RateLimitExceeded { .. }
                | GatewayError::QuotaExceeded { .. }
        )
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
