//! Configuration management for Hearth
//!
//! Repository-level settings for generation runs: scheduling defaults,
//! partial-output flushing, template strictness, artifact retention and the
//! LLM endpoint.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::{ExecutionMode, HearthError, Result};

/// Repository-level Hearth configuration
///
/// Loaded from `.hearth/config.toml` in the repo root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HearthConfig {
    /// Generation run defaults
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Artifact store settings
    #[serde(default)]
    pub artifacts: ArtifactSettings,

    /// Main LLM endpoint
    #[serde(default)]
    pub llm: LlmSettings,
}

/// Generation run defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Scheduling of operations within a hook
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// How often partial assistant text is flushed while streaming
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Fail template rendering on undefined variables unless an operation overrides it
    #[serde(default = "default_strict_variables")]
    pub strict_variables: bool,
}

/// Artifact store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Version retention for persisted artifacts
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Pipeline identity used as the writer prefix for persisted artifacts
    #[serde(default = "default_pipeline_id")]
    pub pipeline_id: String,
}

/// Version retention for persisted artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never prune
    KeepAll,
    /// Prune versions below `latest - max` after each write
    KeepLastN { max: u64 },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepLastN {
            max: default_retention_max(),
        }
    }
}

/// Main LLM endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

// Default value providers
fn default_flush_interval_ms() -> u64 {
    750
}

fn default_strict_variables() -> bool {
    true
}

fn default_retention_max() -> u64 {
    20
}

fn default_pipeline_id() -> String {
    "default".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "HEARTH_LLM_API_KEY".to_string()
}

impl HearthConfig {
    /// Load configuration from `.hearth/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".hearth/config.toml");

        if config_path.exists() {
            debug!("Loading config from {:?}", config_path);
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HearthError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.hearth/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".hearth");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| HearthError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            flush_interval_ms: default_flush_interval_ms(),
            strict_variables: default_strict_variables(),
        }
    }
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            pipeline_id: default_pipeline_id(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: None,
        }
    }
}
