//! Deterministic backend used when no LLM endpoint is configured

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::errors::{GatewayError, Result};
use crate::core::models::{
    estimate_tokens, Choice, CompletionRequest, Delta, GenerationResponse, Model, Usage,
};
use crate::llm::{preview, LlmBackend, ResponseStream, STREAM_BUFFER};

/// Canned answers, one picked per prompt
const CANNED_RESPONSES: &[&str] = &[
    "This is a stubbed response from the generation gateway. Configure a backend URL to reach a real model.",
    "Here is a generated response that demonstrates the streaming behaviour of the generation gateway.",
    "The gateway is running without a model backend and answers every prompt with a canned sentence.",
    "This response shows how streamed generations reach the client once a real backend is connected.",
];

/// Pick the canned answer for a prompt: sum of its characters mod the set size
pub fn canned_response(prompt: &str) -> &'static str {
    let hash: u64 = prompt.chars().map(|c| c as u64).sum();
    CANNED_RESPONSES[(hash % CANNED_RESPONSES.len() as u64) as usize]
}

/// Catalog returned when no backend can be asked
pub fn default_catalog() -> Vec<Model> {
    vec![Model {
        id: "default".to_string(),
        name: "Default Model".to_string(),
        description: "Built-in stub model".to_string(),
        provider: "stub".to_string(),
        max_tokens: 4096,
        created_at: Utc::now(),
    }]
}

pub(crate) fn new_response_id() -> String {
    format!("gen-{}", Uuid::new_v4().simple())
}

/// Backend answering from [`CANNED_RESPONSES`]
#[derive(Debug, Clone)]
pub struct StubBackend {
    word_delay: Duration,
}

impl StubBackend {
    pub fn new(word_delay: Duration) -> Self {
        Self { word_delay }
    }

    fn usage(prompt: &str, completion_tokens: u64) -> Usage {
        let prompt_tokens = estimate_tokens(prompt);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl LlmBackend for StubBackend {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn generate(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        if cancel.is_cancelled() {
            return Err(GatewayError::ClientDisconnect);
        }
        debug!(model = %request.model, prompt = %preview(&request.prompt, 100), "Stub generate");

        let text = canned_response(&request.prompt);
        let words = text.split_whitespace().count() as u64;

        Ok(GenerationResponse {
            id: new_response_id(),
            object: "text_completion".to_string(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                text: Some(text.to_string()),
                delta: None,
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Self::usage(&request.prompt, words)),
        })
    }

    async fn generate_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream> {
        info!(model = %request.model, prompt = %preview(&request.prompt, 100), "Stub stream");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let words: Vec<&'static str> = canned_response(&request.prompt).split_whitespace().collect();
        let model = request.model.clone();
        let usage = Self::usage(&request.prompt, words.len() as u64);
        let delay = self.word_delay;

        tokio::spawn(async move {
            let id = new_response_id();
            let last = words.len().saturating_sub(1);

            for (i, word) in words.iter().enumerate() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }

                let content = if i < last {
                    format!("{} ", word)
                } else {
                    word.to_string()
                };
                let chunk = GenerationResponse {
                    id: id.clone(),
                    object: "text_completion.chunk".to_string(),
                    model: model.clone(),
                    choices: vec![Choice {
                        index: 0,
                        text: None,
                        delta: Some(Delta {
                            content: Some(content),
                        }),
                        finish_reason: (i == last).then(|| "stop".to_string()),
                    }],
                    usage: (i == last).then_some(usage),
                };

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn models(&self) -> Vec<Model> {
        default_catalog()
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            model: "stub-model".to_string(),
            prompt: prompt.to_string(),
            max_tokens: None,
            temperature: None,
            stream: true,
        }
    }

    #[test]
    fn test_canned_response_is_deterministic() {
        assert_eq!(canned_response("hello"), canned_response("hello"));
        // "hello" sums to 532, 532 % 4 == 0
        assert_eq!(canned_response("hello"), CANNED_RESPONSES[0]);
        assert_eq!(canned_response("a"), CANNED_RESPONSES[97 % 4]);
    }

    #[tokio::test]
    async fn test_stub_generate() {
        let backend = StubBackend::new(Duration::ZERO);
        let response = backend
            .generate(&request("hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content(), CANNED_RESPONSES[0]);
        assert_eq!(response.finish_reason(), Some("stop"));
        assert_eq!(response.model, "stub-model");
        assert!(response.used_tokens() > 0);
    }

    #[tokio::test]
    async fn test_stub_stream_word_by_word() {
        let backend = StubBackend::new(Duration::ZERO);
        let mut rx = backend
            .generate_stream(&request("hello"), CancellationToken::new())
            .await
            .unwrap();

        let mut text = String::new();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            text.push_str(chunk.content());
            chunks.push(chunk);
        }

        assert_eq!(text, CANNED_RESPONSES[0]);
        assert_eq!(chunks.len(), CANNED_RESPONSES[0].split_whitespace().count());
        let (last, rest) = chunks.split_last().unwrap();
        assert_eq!(last.finish_reason(), Some("stop"));
        assert!(last.usage.is_some());
        assert!(rest.iter().all(|c| c.finish_reason().is_none()));
    }

    #[tokio::test]
    async fn test_stub_stream_stops_on_cancel() {
        let backend = StubBackend::new(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let mut rx = backend
            .generate_stream(&request("hello"), cancel.clone())
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        cancel.cancel();

        let mut remaining = 0;
        while rx.recv().await.is_some() {
            remaining += 1;
        }
        assert!(remaining <= 1);
    }
}
