//! # hearth-core
//!
//! Core types for the Hearth chat generation runtime.
//!
//! A generation run turns one user turn into one assistant turn. Around the
//! single main LLM call, configurable template *operations* run at two hooks
//! and produce typed *effects* that are committed to the run's shared state.
//! This crate holds the vocabulary every other crate speaks:
//!
//! - Hooks, roles, execution modes and artifact persistence kinds
//! - Session and writer identities used by the persisted artifact store
//! - The unified error type and its stable error codes
//! - Repository-level configuration

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{ArtifactSettings, GenerationSettings, HearthConfig, LlmSettings, RetentionPolicy};
pub use error::{HearthError, Result};
pub use types::*;
