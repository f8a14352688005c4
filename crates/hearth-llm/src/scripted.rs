//! Scripted client that replays fixed chunks

use async_trait::async_trait;
use hearth_core::{HearthError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::{ChunkStream, LlmClient, LlmRequest, StreamChunk};

/// LLM client that replays a fixed script
///
/// Waits `delay` before each chunk and stops as soon as the cancellation
/// token fires. Every request is recorded for inspection.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlmClient {
    chunks: Vec<StreamChunk>,
    delay: Duration,
    start_error: Option<String>,
    requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl ScriptedLlmClient {
    pub fn new(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            ..Self::default()
        }
    }

    /// Script that streams `text` split into word-sized deltas
    pub fn from_text(text: &str) -> Self {
        let chunks = text
            .split_inclusive(' ')
            .map(|piece| StreamChunk::Delta(piece.to_string()))
            .collect();
        Self::new(chunks)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the call before any chunk is produced
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            start_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn stream(&self, request: LlmRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        if let Some(message) = &self.start_error {
            return Err(HearthError::Llm(message.clone()));
        }

        let chunks = self.chunks.clone();
        let delay = self.delay;
        let stream = async_stream::stream! {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                yield chunk;
            }
        };

        Ok(Box::pin(stream))
    }
}
