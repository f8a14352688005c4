//! Persisted artifact backend contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_core::{Result, SessionKey, WriterId};
use serde::{Deserialize, Serialize};

use crate::value::ArtifactValue;

/// One stored version of a persisted artifact tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub tag: String,
    /// Starts at 1 and grows by exactly one per successful write
    pub version: u64,
    pub value: ArtifactValue,
    /// Exclusive owner of writes to this tag
    pub writer: WriterId,
    pub written_at: DateTime<Utc>,
}

/// Outcome of a versioned write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row was stored
    Written(StoredArtifact),
    /// The requested version is not `current_version + 1`
    Conflict { current_version: u64 },
    /// The tag belongs to another writer; nothing was mutated
    Forbidden { owner: WriterId },
}

/// Storage for versioned artifacts shared across runs and sessions
///
/// `write` must perform its owner and version checks atomically with the
/// row insert. Implementations never overwrite an existing version.
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Newest version of one tag
    async fn latest(&self, session: &SessionKey, tag: &str) -> Result<Option<StoredArtifact>>;

    /// Newest version of every tag in a session, sorted by tag
    async fn list_latest(&self, session: &SessionKey) -> Result<Vec<StoredArtifact>>;

    /// Store `value` as `version` of `tag`, owned by `writer`
    async fn write(
        &self,
        session: &SessionKey,
        tag: &str,
        version: u64,
        value: &ArtifactValue,
        writer: &WriterId,
    ) -> Result<WriteOutcome>;

    /// Delete versions strictly below `min_version`; returns how many were removed
    async fn prune_below(&self, session: &SessionKey, tag: &str, min_version: u64)
        -> Result<usize>;
}
