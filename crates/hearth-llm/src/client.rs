//! OpenAI-compatible chat completions client with SSE streaming
//!
//! Each call is independent: the full prompt draft is sent, and the reply is
//! streamed back as text deltas until the provider sends `[DONE]`, closes the
//! connection, or the run is cancelled.

use async_trait::async_trait;
use futures::StreamExt;
use hearth_core::{HearthError, LlmSettings, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::auth;
use crate::types::{ChunkStream, LlmClient, LlmRequest, StreamChunk};

/// One parsed SSE line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Error(String),
    Done,
}

/// Parse one line of an SSE response body
///
/// Returns `None` for blank lines, comments, non-data fields and data
/// payloads that carry no text.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let payload: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(SseEvent::Error(format!("Malformed stream payload: {}", e))),
    };

    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(SseEvent::Error(message));
    }

    payload
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Delta(s.to_string()))
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: Option<u32>,
}

impl ChatCompletionsClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens: None,
        }
    }

    /// Build a client from config, reading the API key from the environment
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = auth::api_key_from_env(&settings.api_key_env)?;
        Ok(Self::new(&settings.base_url, &settings.model, api_key)
            .with_max_tokens(settings.max_tokens))
    }

    /// Set the default max tokens for responses
    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn body(&self, request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    #[instrument(skip(self, request, cancel), fields(model = %self.model))]
    async fn stream(&self, request: LlmRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        debug!("Sending {} messages to {}", request.messages.len(), self.endpoint());

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.body(&request))
            .send()
            .await
            .map_err(|e| HearthError::Llm(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(HearthError::Llm(format!(
                "LLM endpoint error {}: {}",
                status, error_text
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            'read: loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = bytes.next() => Some(next),
                };

                let chunk = match next {
                    // Cancelled
                    None => break 'read,
                    // Connection closed
                    Some(None) => break 'read,
                    Some(Some(Err(e))) => {
                        warn!("LLM stream read failed: {}", e);
                        yield StreamChunk::Error(format!("Stream read failed: {}", e));
                        break 'read;
                    }
                    Some(Some(Ok(chunk))) => chunk,
                };

                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        Some(SseEvent::Delta(text)) => yield StreamChunk::Delta(text),
                        Some(SseEvent::Error(message)) => {
                            yield StreamChunk::Error(message);
                            break 'read;
                        }
                        Some(SseEvent::Done) => break 'read,
                        None => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Splits a byte stream into lines
///
/// Bytes are held until a newline arrives, so a character split across
/// network chunks is decoded whole.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}
