//! Scenario files: a chat turn plus the operations to run around it

use anyhow::{Context, Result};
use hearth_core::{ExecutionMode, GenerationTrigger, PromptMessage, SessionKey};
use hearth_runtime::{GenerationRequest, OperationConfig};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_session")]
    pub session: SessionKey,

    #[serde(default)]
    pub pipeline_id: Option<String>,

    #[serde(default)]
    pub trigger: GenerationTrigger,

    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,

    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub history: Vec<PromptMessage>,

    pub user_text: String,

    /// Further user turns, each run after the previous one finished
    #[serde(default)]
    pub followups: Vec<String>,

    /// What the scripted LLM answers when not running live
    #[serde(default = "default_reply")]
    pub reply: String,

    /// Delay between scripted reply chunks
    #[serde(default)]
    pub reply_delay_ms: u64,

    #[serde(default)]
    pub vars: Map<String, Value>,

    #[serde(default)]
    pub operations: Vec<OperationConfig>,
}

fn default_session() -> SessionKey {
    SessionKey::new("local", "scenario")
}

fn default_reply() -> String {
    "Understood.".to_string()
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse scenario {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// User turns in the order they are sent
    pub fn user_turns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.user_text.as_str()).chain(self.followups.iter().map(String::as_str))
    }

    /// Request for one user turn on top of `history`
    pub fn request(
        &self,
        user_text: &str,
        history: Vec<PromptMessage>,
        mode: Option<ExecutionMode>,
    ) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.session.clone(), user_text)
            .with_trigger(self.trigger)
            .with_system_prompt(self.system_prompt.clone())
            .with_history(history)
            .with_operations(self.operations.clone())
            .with_vars(self.vars.clone());
        if let Some(pipeline_id) = &self.pipeline_id {
            request = request.with_pipeline_id(pipeline_id.clone());
        }
        if let Some(mode) = mode.or(self.execution_mode) {
            request = request.with_execution_mode(mode);
        }
        request
    }
}
