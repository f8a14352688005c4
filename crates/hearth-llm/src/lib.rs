//! # hearth-llm
//!
//! Streaming LLM clients for the main call of a generation run.
//!
//! Every client yields an async sequence of [`StreamChunk`]s and observes the
//! run's cancellation token between chunks:
//! - [`ChatCompletionsClient`]: OpenAI-compatible `/chat/completions` over SSE
//! - [`ScriptedLlmClient`]: replays a fixed script, for offline runs and tests

mod auth;
mod client;
mod scripted;
mod types;

pub use auth::api_key_from_env;
pub use client::{parse_sse_line, ChatCompletionsClient, SseEvent};
pub use scripted::ScriptedLlmClient;
pub use types::*;
