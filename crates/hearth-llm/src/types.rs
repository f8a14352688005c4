//! Type definitions for main LLM calls

use async_trait::async_trait;
use futures::Stream;
use hearth_core::{PromptMessage, Result};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// One piece of streamed model output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text to append to the assistant turn
    Delta(String),
    /// The provider reported an error; the stream ends after this
    Error(String),
}

/// Streamed output of one call; the stream ends when the model is done
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Request for the main LLM call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Streaming LLM client
///
/// Implementations stop yielding once `cancel` fires.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start a streamed completion
    async fn stream(&self, request: LlmRequest, cancel: CancellationToken) -> Result<ChunkStream>;
}
