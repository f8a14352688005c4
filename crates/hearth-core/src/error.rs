//! Unified error types for Hearth

use thiserror::Error;

/// Unified error type for all Hearth operations
#[derive(Error, Debug)]
pub enum HearthError {
    // Template errors
    #[error("Template error: {0}")]
    Template(String),

    // Artifact errors
    #[error("Artifact version conflict: {0}")]
    ArtifactConflict(String),

    #[error("Artifact write forbidden: {0}")]
    ArtifactForbidden(String),

    #[error("Artifact backend error: {0}")]
    ArtifactBackend(String),

    // LLM errors
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Missing API key: {0}")]
    MissingApiKey(String),

    // Persistence errors
    #[error("Turn persistence error: {0}")]
    Persistence(String),

    // Run errors
    #[error("Run already registered: {0}")]
    RunAlreadyRegistered(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HearthError {
    /// Stable machine-readable code carried by task and commit reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::Template(_) => "template_error",
            Self::ArtifactConflict(_) => "artifact_conflict",
            Self::ArtifactForbidden(_) => "artifact_forbidden",
            Self::ArtifactBackend(_) => "artifact_backend_error",
            Self::Llm(_) => "llm_error",
            Self::MissingApiKey(_) => "missing_api_key",
            Self::Persistence(_) => "persistence_error",
            Self::RunAlreadyRegistered(_) => "run_already_registered",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

/// Result type alias using HearthError
pub type Result<T> = std::result::Result<T, HearthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(HearthError::Template("x".into()).code(), "template_error");
        assert_eq!(
            HearthError::ArtifactConflict("x".into()).code(),
            "artifact_conflict"
        );
        assert_eq!(
            HearthError::RunAlreadyRegistered("r1".into()).code(),
            "run_already_registered"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = HearthError::ArtifactForbidden("tag world_state".into());
        assert_eq!(err.to_string(), "Artifact write forbidden: tag world_state");
    }
}
