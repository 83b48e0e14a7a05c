//! LLM backend abstraction
//!
//! A backend is chosen once at startup: [`HttpBackend`] when a base URL is
//! configured, [`StubBackend`] otherwise. Both speak the same trait, so the
//! rest of the gateway never branches on the mode.

pub mod http;
pub mod stream;
pub mod stub;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::GatewayConfig;
use crate::core::errors::Result;
use crate::core::models::{CompletionRequest, GenerationResponse, Model};

pub use http::HttpBackend;
pub use stub::StubBackend;

/// Capacity of every backend chunk channel
pub const STREAM_BUFFER: usize = 10;

/// Chunks from a streaming call; the producer closes it by dropping its sender
pub type ResponseStream = mpsc::Receiver<Result<GenerationResponse>>;

/// A generation backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short backend label for logs and health output
    fn kind(&self) -> &'static str;

    /// Single, non-streaming generation
    async fn generate(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse>;

    /// Start a streaming generation
    ///
    /// Returns once the backend accepted the request; chunks then arrive on
    /// the returned channel until it closes. Cancelling `cancel` stops the
    /// producer.
    async fn generate_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream>;

    /// Model catalog; never fails, falls back to a static list
    async fn models(&self) -> Vec<Model>;

    /// Liveness of the backend
    async fn health(&self) -> Result<()>;
}

/// Select the backend for this process
pub fn backend_from_config(config: &GatewayConfig) -> Result<Arc<dyn LlmBackend>> {
    match &config.llm_base_url {
        Some(base_url) => {
            info!(base_url = %base_url, "Using HTTP LLM backend");
            Ok(Arc::new(HttpBackend::new(base_url, config)?))
        }
        None => {
            info!("No LLM base URL configured, using stub backend");
            Ok(Arc::new(StubBackend::new(config.stub_word_delay())))
        }
    }
}

/// Shorten a prompt for log output
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
