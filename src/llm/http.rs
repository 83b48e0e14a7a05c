//! HTTP backend for OpenAI-compatible completion servers, with retry logic

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::errors::{GatewayError, Result};
use crate::core::models::{CompletionRequest, GenerationResponse, Model};
use crate::llm::stream::forward_sse;
use crate::llm::stub::default_catalog;
use crate::llm::{preview, LlmBackend, ResponseStream, STREAM_BUFFER};

/// `GET /v1/models` payload
#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    created: i64,
}

/// Live backend client
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    health_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpBackend {
    /// Create a backend for `base_url`
    pub fn new(base_url: &str, config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            health_timeout: config.health_timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    /// Send with retries on transport errors and 5xx responses
    ///
    /// Waits `(attempt + 1) * retry_delay` between attempts. Other non-2xx
    /// statuses come back untouched for the caller to reject.
    async fn send_with_retry<F>(&self, build: F, cancel: &CancellationToken) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let wait = self.retry_delay * attempt;
                warn!(
                    attempt = attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %last_error,
                    "Backend request failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::ClientDisconnect),
                    _ = sleep(wait) => {}
                }
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::ClientDisconnect),
                sent = build().send() => sent,
            };

            match sent {
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status().as_u16();
                    let body = self.read_body(response).await;
                    last_error = format!("status {}: {}", status, body);
                }
                Ok(response) => {
                    if attempt > 0 {
                        info!("Backend request succeeded after {} retries", attempt);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(GatewayError::UpstreamUnavailable {
            attempts,
            message: last_error,
        })
    }

    /// Error body text, bounded by the request timeout
    async fn read_body(&self, response: reqwest::Response) -> String {
        match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out reading error body".to_string(),
        }
    }

    /// Turn a non-2xx response into an error
    async fn ensure_success(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = self.read_body(response).await;
        Err(GatewayError::Upstream {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn generate(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        info!(
            model = %request.model,
            prompt = %preview(&request.prompt, 100),
            max_tokens = ?request.max_tokens,
            "Backend generate request"
        );

        let body = CompletionRequest {
            stream: false,
            ..request.clone()
        };
        let url = self.url("/v1/completions");

        let response = self
            .send_with_retry(
                || {
                    self.authorize(self.client.post(&url))
                        .timeout(self.timeout)
                        .json(&body)
                },
                cancel,
            )
            .await?;
        let response = self.ensure_success(response).await?;

        response
            .json::<GenerationResponse>()
            .await
            .map_err(|e| GatewayError::Decode {
                message: e.to_string(),
            })
    }

    async fn generate_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream> {
        info!(
            model = %request.model,
            prompt = %preview(&request.prompt, 100),
            "Backend stream request"
        );

        let body = CompletionRequest {
            stream: true,
            ..request.clone()
        };
        let url = self.url("/v1/completions");

        // Bounded per read instead of in total so long streams can finish
        let response = self
            .send_with_retry(
                || {
                    self.authorize(self.client.post(&url))
                        .header("Accept", "text/event-stream")
                        .header("Cache-Control", "no-cache")
                        .json(&body)
                },
                &cancel,
            )
            .await?;
        let response = self.ensure_success(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(forward_sse(response.bytes_stream(), tx, cancel, self.timeout));

        Ok(rx)
    }

    async fn models(&self) -> Vec<Model> {
        let sent = self
            .authorize(self.client.get(self.url("/v1/models")))
            .timeout(self.timeout)
            .send()
            .await;

        let response = match sent {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = response.status().as_u16(), "Models endpoint failed, using static catalog");
                return default_catalog();
            }
            Err(e) => {
                warn!(error = %e, "Models endpoint unreachable, using static catalog");
                return default_catalog();
            }
        };

        match response.json::<ModelList>().await {
            Ok(list) if !list.data.is_empty() => list
                .data
                .into_iter()
                .map(|entry| Model {
                    name: entry.id.clone(),
                    description: format!("Model {} served by the backend", entry.id),
                    provider: "vllm".to_string(),
                    max_tokens: 4096,
                    created_at: DateTime::from_timestamp(entry.created, 0).unwrap_or_else(Utc::now),
                    id: entry.id,
                })
                .collect(),
            Ok(_) => {
                debug!("Backend returned no models, using static catalog");
                default_catalog()
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse models response, using static catalog");
                default_catalog()
            }
        }
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(self.url("/health")))
            .timeout(self.health_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Upstream {
                status: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}
