//! Reading Server-Sent-Events bodies from a backend

use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::errors::{GatewayError, Result};
use crate::core::models::GenerationResponse;

/// Sentinel payload ending a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into lines, tolerating lines split across reads
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    /// Feed bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left after the body ended
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// A meaningful SSE line
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    Data(&'a str),
    Done,
}

/// Extract the payload of a `data:` line; other fields are ignored
pub fn parse_line(line: &str) -> Option<SseLine<'_>> {
    let payload = line.trim().strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        Some(SseLine::Done)
    } else {
        Some(SseLine::Data(payload))
    }
}

/// Decode one backend chunk
pub fn decode_chunk(payload: &str) -> Result<GenerationResponse> {
    serde_json::from_str(payload).map_err(|e| GatewayError::Decode {
        message: e.to_string(),
    })
}

/// Outcome of handling one line
enum Flow {
    Continue,
    Stop,
}

async fn handle_line(
    line: &str,
    tx: &mpsc::Sender<Result<GenerationResponse>>,
    cancel: &CancellationToken,
) -> Flow {
    let payload = match parse_line(line) {
        Some(SseLine::Data(payload)) => payload,
        Some(SseLine::Done) => {
            debug!("Backend stream finished");
            return Flow::Stop;
        }
        None => return Flow::Continue,
    };

    let chunk = match decode_chunk(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, data = %payload, "Skipping malformed stream chunk");
            return Flow::Continue;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Flow::Stop,
        sent = tx.send(Ok(chunk)) => match sent {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!("Chunk receiver dropped, stopping reader");
                Flow::Stop
            }
        },
    }
}

/// Forward decoded chunks from an SSE body until `[DONE]`, EOF or cancellation
///
/// A body that yields nothing for `idle_timeout` is treated as a dead
/// backend. Owns `tx`; the channel closes when this returns, on every path.
pub async fn forward_sse<S, B, E>(
    body: S,
    tx: mpsc::Sender<Result<GenerationResponse>>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    tokio::pin!(body);
    let mut decoder = SseLineDecoder::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream reader cancelled");
                return;
            }
            next = timeout(idle_timeout, body.next()) => next,
        };

        let next = match next {
            Ok(next) => next,
            Err(_) => {
                warn!(idle_ms = idle_timeout.as_millis() as u64, "Backend stream stalled");
                let _ = tx
                    .send(Err(GatewayError::UpstreamUnavailable {
                        attempts: 1,
                        message: format!(
                            "no data from backend for {}ms",
                            idle_timeout.as_millis()
                        ),
                    }))
                    .await;
                return;
            }
        };

        match next {
            Some(Ok(bytes)) => {
                for line in decoder.push(bytes.as_ref()) {
                    if let Flow::Stop = handle_line(&line, &tx, &cancel).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Backend stream read failed");
                let _ = tx
                    .send(Err(GatewayError::UpstreamUnavailable {
                        attempts: 1,
                        message: e.to_string(),
                    }))
                    .await;
                return;
            }
            None => break,
        }
    }

    if let Some(line) = decoder.finish() {
        let _ = handle_line(&line, &tx, &cancel).await;
    }
}
