//! Versioned artifact store with optimistic concurrency
//!
//! Writes name the version they were based on. A mismatch with the stored
//! version is a conflict, never a silent overwrite, so two concurrent writers
//! cannot lose an update. The first writer of a tag owns it; other writers
//! are rejected before any row is touched.

use hearth_core::fail_open::fail_open;
use hearth_core::{HearthError, Persistence, Result, RetentionPolicy, SessionKey, WriterId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::backend::{ArtifactBackend, StoredArtifact, WriteOutcome};
use crate::value::{ArtifactUpsert, ArtifactValue};

/// Persisted artifacts shared across runs of a session
#[derive(Clone)]
pub struct PersistedArtifactStore {
    backend: Arc<dyn ArtifactBackend>,
    retention: RetentionPolicy,
}

impl PersistedArtifactStore {
    pub fn new(backend: Arc<dyn ArtifactBackend>, retention: RetentionPolicy) -> Self {
        Self { backend, retention }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Newest stored version of a tag
    pub async fn latest(&self, session: &SessionKey, tag: &str) -> Result<Option<StoredArtifact>> {
        self.backend.latest(session, tag).await
    }

    /// Newest version of every tag in the session
    pub async fn snapshot(&self, session: &SessionKey) -> Result<BTreeMap<String, StoredArtifact>> {
        let latest = self.backend.list_latest(session).await?;
        Ok(latest.into_iter().map(|s| (s.tag.clone(), s)).collect())
    }

    /// Write the next version of a tag
    ///
    /// `based_on_version` is the version the caller last read (0 when the tag
    /// did not exist). On success the stored version is exactly
    /// `based_on_version + 1` and history has grown by one entry.
    #[instrument(skip(self, upsert), fields(tag = %upsert.tag))]
    pub async fn upsert(
        &self,
        session: &SessionKey,
        upsert: &ArtifactUpsert,
        based_on_version: u64,
        writer: &WriterId,
    ) -> Result<StoredArtifact> {
        let tag = upsert.tag.as_str();
        let previous = self.backend.latest(session, tag).await?;

        if let Some(prev) = &previous {
            if &prev.writer != writer {
                return Err(forbidden(tag, &prev.writer, writer));
            }
        }

        let current_version = previous.as_ref().map(|p| p.version).unwrap_or(0);
        if current_version != based_on_version {
            return Err(conflict(tag, based_on_version, current_version));
        }

        let mut next = ArtifactValue::next(previous.as_ref().map(|p| &p.value), upsert);
        next.persistence = Persistence::Persisted;

        let stored = match self
            .backend
            .write(session, tag, based_on_version + 1, &next, writer)
            .await?
        {
            WriteOutcome::Written(stored) => stored,
            WriteOutcome::Conflict { current_version } => {
                return Err(conflict(tag, based_on_version, current_version))
            }
            WriteOutcome::Forbidden { owner } => return Err(forbidden(tag, &owner, writer)),
        };

        debug!("Persisted artifact {} at v{}", tag, stored.version);

        if let RetentionPolicy::KeepLastN { max } = self.retention {
            if max > 0 && stored.version > max {
                let min_version = stored.version - max;
                fail_open(
                    "artifact_retention",
                    self.backend.prune_below(session, tag, min_version),
                )
                .await;
            }
        }

        Ok(stored)
    }
}

fn conflict(tag: &str, based_on: u64, current: u64) -> HearthError {
    HearthError::ArtifactConflict(format!(
        "tag {} was written based on v{} but the stored version is v{}",
        tag, based_on, current
    ))
}

fn forbidden(tag: &str, owner: &WriterId, writer: &WriterId) -> HearthError {
    HearthError::ArtifactForbidden(format!(
        "tag {} is owned by {}; {} may not write it",
        tag, owner, writer
    ))
}
