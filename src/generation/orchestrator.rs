//! Streaming generation pipeline: admission, streaming, bookkeeping

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::errors::{GatewayError, Result};
use crate::core::models::{
    CompletionRequest, GenerationHistory, GenerationRequest, GenerationResponse, Model,
    QuotaStatus, RequestDefaults, StreamChunk, StreamEvent, UNKNOWN_MODEL,
};
use crate::core::rate_limiter::KeyedRateLimiter;
use crate::fanout::{EventFanout, GenerationEvent};
use crate::generation::repository::Repository;
use crate::llm::{LlmBackend, STREAM_BUFFER};

/// A request that passed validation, rate limiting and the quota check
#[derive(Debug, Clone)]
pub struct Admission {
    pub generation_id: String,
    pub request: GenerationRequest,
    pub completion: CompletionRequest,
    pub quota: QuotaStatus,
}

/// Result of a finished streaming generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub generation_id: String,
    pub content: String,
    pub model: String,
    pub total_tokens: u64,
}

/// What has been streamed so far
#[derive(Debug, Default)]
struct Accumulator {
    content: String,
    tokens: u64,
    model: Option<String>,
    seq: u64,
}

impl Accumulator {
    fn absorb(&mut self, chunk: &StreamChunk) {
        if self.model.is_none() {
            self.model = chunk.model.clone().filter(|m| !m.is_empty());
        }
        self.content.push_str(&chunk.content);
        self.tokens += chunk.token_count;
    }

    fn next_id(&mut self, generation_id: &str) -> String {
        let id = format!("{}:{}", generation_id, self.seq);
        self.seq += 1;
        id
    }

    fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
    }
}

/// Runs generations end to end
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn LlmBackend>,
    limiter: Arc<KeyedRateLimiter>,
    repository: Arc<dyn Repository>,
    fanout: EventFanout,
    defaults: RequestDefaults,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        limiter: Arc<KeyedRateLimiter>,
        repository: Arc<dyn Repository>,
        fanout: EventFanout,
        defaults: RequestDefaults,
    ) -> Self {
        Self {
            backend,
            limiter,
            repository,
            fanout,
            defaults,
        }
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    pub fn fanout(&self) -> &EventFanout {
        &self.fanout
    }

    /// Model catalog of the backend
    pub async fn models(&self) -> Vec<Model> {
        self.backend.models().await
    }

    /// Current quota of a user
    pub async fn quota_status(&self, user_id: &str) -> Result<QuotaStatus> {
        self.repository.get_quota_usage(user_id).await
    }

    /// Validate, rate limit and check quota; no backend call is made
    pub async fn admit(&self, request: GenerationRequest) -> Result<Admission> {
        request.validate()?;

        if !self.limiter.allow(&request.user_id) {
            warn!(user_id = %request.user_id, "Rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded {
                key: request.user_id.clone(),
            });
        }

        let quota = self.repository.get_quota_usage(&request.user_id).await?;
        if !quota.can_generate() {
            warn!(
                user_id = %request.user_id,
                used_today = quota.used_today,
                daily_limit = quota.daily_limit,
                "Daily quota exceeded"
            );
            return Err(GatewayError::QuotaExceeded {
                user_id: request.user_id.clone(),
                daily_limit: quota.daily_limit,
                used_today: quota.used_today,
            });
        }

        let completion = request.to_completion(&self.defaults, true);
        Ok(Admission {
            generation_id: Uuid::new_v4().to_string(),
            request,
            completion,
            quota,
        })
    }

    /// Admit and stream; an admission failure is reported as one `error` event
    pub async fn execute(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome> {
        match self.admit(request).await {
            Ok(admission) => self.stream(admission, tx, cancel).await,
            Err(e) => {
                let _ = tx.send(StreamEvent::error(&e)).await;
                Err(e)
            }
        }
    }

    /// Stream an admitted request into `tx`
    ///
    /// Emits `chunk` events in backend order, then either one `complete`
    /// event or one `error` event. Cancelling `cancel` or dropping the
    /// receiver stops the backend; content streamed so far is still stored
    /// and counted, but nothing is published.
    pub async fn stream(
        &self,
        admission: Admission,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome> {
        let Admission {
            generation_id,
            request,
            completion,
            ..
        } = admission;

        info!(
            generation_id = %generation_id,
            user_id = %request.user_id,
            model = %completion.model,
            "Starting streaming generation"
        );

        let backend_cancel = cancel.child_token();
        let _backend_guard = backend_cancel.clone().drop_guard();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_chunks(
            self.backend.clone(),
            completion,
            chunk_tx,
            backend_cancel,
        ));

        let mut acc = Accumulator::default();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = chunk_rx.recv() => Some(next),
            };
            let mut chunk = match next {
                None => return self.abandon(&generation_id, &request, acc).await,
                Some(None) => break,
                Some(Some(chunk)) => chunk,
            };

            if let Some(err) = chunk.error.take() {
                if cancel.is_cancelled() || matches!(err, GatewayError::ClientDisconnect) {
                    return self.abandon(&generation_id, &request, acc).await;
                }
                error!(generation_id = %generation_id, error = %err, "Generation failed mid-stream");
                let event = StreamEvent::error(&err).with_id(acc.next_id(&generation_id));
                let _ = tx.send(event).await;
                return Err(err);
            }

            acc.absorb(&chunk);
            let is_complete = chunk.is_complete;
            let event = StreamEvent::chunk(chunk.content, chunk.token_count, is_complete)
                .with_model(chunk.model)
                .with_id(acc.next_id(&generation_id));
            if !emit(&tx, event, &cancel).await {
                return self.abandon(&generation_id, &request, acc).await;
            }
            if is_complete {
                break;
            }
        }

        let model = acc.model();
        let complete_id = acc.next_id(&generation_id);
        let outcome = GenerationOutcome {
            generation_id: generation_id.clone(),
            content: acc.content,
            model: model.clone(),
            total_tokens: acc.tokens,
        };

        self.record(&request, &outcome, true).await;
        self.publish(&request, &outcome);

        let event = StreamEvent::complete(outcome.total_tokens, model).with_id(complete_id);
        if !emit(&tx, event, &cancel).await {
            debug!(generation_id = %generation_id, "Caller left before the complete event");
        }

        info!(
            generation_id = %generation_id,
            tokens = outcome.total_tokens,
            model = %outcome.model,
            "Streaming generation finished"
        );
        Ok(outcome)
    }

    /// Single-shot generation through the same admission and bookkeeping
    pub async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        let admission = self.admit(request).await?;
        let completion = CompletionRequest {
            stream: false,
            ..admission.completion
        };

        let response = self.backend.generate(&completion, cancel).await?;
        let model = Some(response.model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or(completion.model);

        let outcome = GenerationOutcome {
            generation_id: admission.generation_id,
            content: response.content().to_string(),
            model,
            total_tokens: response.used_tokens(),
        };
        self.record(&admission.request, &outcome, true).await;
        self.publish(&admission.request, &outcome);

        Ok(response)
    }

    /// The caller went away: keep what was produced, skip the fan-out
    async fn abandon(
        &self,
        generation_id: &str,
        request: &GenerationRequest,
        acc: Accumulator,
    ) -> Result<GenerationOutcome> {
        info!(generation_id = %generation_id, user_id = %request.user_id, "Client disconnected");
        if !acc.content.is_empty() {
            let outcome = GenerationOutcome {
                generation_id: generation_id.to_string(),
                model: acc.model(),
                content: acc.content,
                total_tokens: acc.tokens,
            };
            self.record(request, &outcome, false).await;
        }
        Err(GatewayError::ClientDisconnect)
    }

    /// Save history and count tokens; failures are logged only
    async fn record(&self, request: &GenerationRequest, outcome: &GenerationOutcome, completed: bool) {
        let history = GenerationHistory {
            id: outcome.generation_id.clone(),
            user_id: request.user_id.clone(),
            project_id: request.project().map(str::to_string),
            prompt: request.prompt.clone(),
            content: outcome.content.clone(),
            model: outcome.model.clone(),
            tokens: outcome.total_tokens,
            completed,
            created_at: Utc::now(),
        };

        if let Err(e) = self.repository.save_generation(&history).await {
            error!(generation_id = %history.id, error = %e, "Failed to save generation history");
        }
        if let Err(e) = self
            .repository
            .update_quota_usage(&request.user_id, outcome.total_tokens)
            .await
        {
            error!(user_id = %request.user_id, error = %e, "Failed to update quota usage");
        }
    }

    fn publish(&self, request: &GenerationRequest, outcome: &GenerationOutcome) {
        let event = GenerationEvent {
            generation_id: outcome.generation_id.clone(),
            user_id: request.user_id.clone(),
            project_id: request.project().map(str::to_string),
            model: outcome.model.clone(),
            total_tokens: outcome.total_tokens,
        };
        let fanout = self.fanout.clone();
        tokio::spawn(async move {
            fanout.publish(&event).await;
        });
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.kind())
            .field("limiter", &self.limiter)
            .field("fanout", &self.fanout)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Send unless the caller is gone
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Background producer: backend responses in, mapped chunks out
///
/// Sole owner of `tx`; the orchestrator sees the channel close when this
/// returns.
async fn pump_chunks(
    backend: Arc<dyn LlmBackend>,
    request: CompletionRequest,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
) {
    let mut responses = match backend.generate_stream(&request, cancel.clone()).await {
        Ok(responses) => responses,
        Err(e) => {
            let _ = tx.send(StreamChunk::failed(e)).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = responses.recv() => next,
        };
        let chunk = match next {
            Some(Ok(response)) => StreamChunk::from_response(&response),
            Some(Err(e)) => StreamChunk::failed(e),
            None => return,
        };
        let failed = chunk.error.is_some();
        if tx.send(chunk).await.is_err() || failed {
            return;
        }
    }
}
