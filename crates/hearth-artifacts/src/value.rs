//! Artifact value contract shared by both stores

use hearth_core::Persistence;
use serde::{Deserialize, Serialize};

/// A named piece of run or session state
///
/// `history` is append-only, oldest first, and always ends with `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactValue {
    /// Free-form hint for how templates should use the artifact
    pub usage: String,
    /// Free-form description of what the value means
    pub semantics: String,
    pub persistence: Persistence,
    pub value: String,
    pub history: Vec<String>,
}

impl ArtifactValue {
    /// First write of a tag seeds history with the value
    pub fn seed(upsert: &ArtifactUpsert) -> Self {
        Self {
            usage: upsert.usage.clone(),
            semantics: upsert.semantics.clone(),
            persistence: upsert.persistence,
            value: upsert.value.clone(),
            history: vec![upsert.value.clone()],
        }
    }

    /// Next value of an existing tag: metadata is replaced, history grows by one
    pub fn advanced(&self, upsert: &ArtifactUpsert) -> Self {
        let mut history = self.history.clone();
        history.push(upsert.value.clone());
        Self {
            usage: upsert.usage.clone(),
            semantics: upsert.semantics.clone(),
            persistence: upsert.persistence,
            value: upsert.value.clone(),
            history,
        }
    }

    /// Seed or advance depending on whether a previous value exists
    pub fn next(previous: Option<&ArtifactValue>, upsert: &ArtifactUpsert) -> Self {
        match previous {
            Some(prev) => prev.advanced(upsert),
            None => Self::seed(upsert),
        }
    }
}

/// Write request for one artifact tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUpsert {
    pub tag: String,
    pub persistence: Persistence,
    pub usage: String,
    pub semantics: String,
    pub value: String,
}

impl ArtifactUpsert {
    pub fn run_only(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            persistence: Persistence::RunOnly,
            usage: String::new(),
            semantics: String::new(),
            value: value.into(),
        }
    }

    pub fn persisted(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            persistence: Persistence::Persisted,
            ..Self::run_only(tag, value)
        }
    }
}
