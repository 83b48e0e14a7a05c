//! Stream Gateway - streaming LLM generation gateway
//!
//! This library admits generation requests through a per-user rate limiter
//! and daily token quota, streams completions from an OpenAI-compatible
//! backend (or a built-in stub), relays them to HTTP clients as Server-Sent
//! Events and fans finished generations out over a pub/sub bus.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod fanout;
pub mod gateway;
pub mod generation;
pub mod llm;
pub mod server;

// Re-export key types for convenience
pub use crate::core::{
    config::GatewayConfig,
    errors::{GatewayError, Result},
    models::{GenerationRequest, GenerationResponse, Model, QuotaStatus, StreamChunk, StreamEvent},
    quota::QuotaManager,
    rate_limiter::KeyedRateLimiter,
};

pub use fanout::{EventFanout, PubSub};
pub use gateway::Gateway;
pub use generation::{Orchestrator, Repository};
pub use llm::LlmBackend;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
