//! In-process artifact backend

use async_trait::async_trait;
use chrono::Utc;
use hearth_core::{Result, SessionKey, WriterId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{ArtifactBackend, StoredArtifact, WriteOutcome};
use crate::value::ArtifactValue;

#[derive(Debug)]
struct TagRows {
    owner: WriterId,
    versions: BTreeMap<u64, StoredArtifact>,
}

/// Artifact backend held in memory
///
/// Used by the CLI and tests. A single lock makes the owner check, the
/// version check and the insert one atomic step.
#[derive(Debug, Default)]
pub struct InMemoryArtifactBackend {
    rows: Mutex<HashMap<(SessionKey, String), TagRows>>,
}

impl InMemoryArtifactBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored version numbers of a tag, ascending
    pub async fn versions(&self, session: &SessionKey, tag: &str) -> Vec<u64> {
        let rows = self.rows.lock().await;
        rows.get(&(session.clone(), tag.to_string()))
            .map(|r| r.versions.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactBackend for InMemoryArtifactBackend {
    async fn latest(&self, session: &SessionKey, tag: &str) -> Result<Option<StoredArtifact>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(session.clone(), tag.to_string()))
            .and_then(|r| r.versions.values().next_back().cloned()))
    }

    async fn list_latest(&self, session: &SessionKey) -> Result<Vec<StoredArtifact>> {
        let rows = self.rows.lock().await;
        let mut latest: Vec<StoredArtifact> = rows
            .iter()
            .filter(|((key, _), _)| key == session)
            .filter_map(|(_, r)| r.versions.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(latest)
    }

    async fn write(
        &self,
        session: &SessionKey,
        tag: &str,
        version: u64,
        value: &ArtifactValue,
        writer: &WriterId,
    ) -> Result<WriteOutcome> {
        let mut rows = self.rows.lock().await;
        let key = (session.clone(), tag.to_string());

        let current_version = match rows.get(&key) {
            Some(existing) => {
                if &existing.owner != writer {
                    return Ok(WriteOutcome::Forbidden {
                        owner: existing.owner.clone(),
                    });
                }
                existing.versions.keys().next_back().copied().unwrap_or(0)
            }
            None => 0,
        };

        if version != current_version + 1 {
            return Ok(WriteOutcome::Conflict { current_version });
        }

        let stored = StoredArtifact {
            tag: tag.to_string(),
            version,
            value: value.clone(),
            writer: writer.clone(),
            written_at: Utc::now(),
        };

        rows.entry(key)
            .or_insert_with(|| TagRows {
                owner: writer.clone(),
                versions: BTreeMap::new(),
            })
            .versions
            .insert(version, stored.clone());

        debug!("Stored artifact {} v{} for {}", tag, version, session);
        Ok(WriteOutcome::Written(stored))
    }

    async fn prune_below(
        &self,
        session: &SessionKey,
        tag: &str,
        min_version: u64,
    ) -> Result<usize> {
        let mut rows = self.rows.lock().await;
        let Some(entry) = rows.get_mut(&(session.clone(), tag.to_string())) else {
            return Ok(0);
        };

        let kept = entry.versions.split_off(&min_version);
        let removed = entry.versions.len();
        entry.versions = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ArtifactUpsert;

    fn session() -> SessionKey {
        SessionKey::new("owner", "chat")
    }

    fn value(v: &str) -> ArtifactValue {
        ArtifactValue::seed(&ArtifactUpsert::persisted("world", v))
    }

    #[tokio::test]
    async fn test_first_write_must_be_version_one() {
        let backend = InMemoryArtifactBackend::new();
        let writer = WriterId::new("p", "s");

        let outcome = backend
            .write(&session(), "world", 2, &value("a"), &writer)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict { current_version: 0 });

        let outcome = backend
            .write(&session(), "world", 1, &value("a"), &writer)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Written(ref s) if s.version == 1));
    }

    #[tokio::test]
    async fn test_other_writer_is_forbidden() {
        let backend = InMemoryArtifactBackend::new();
        let owner = WriterId::new("p1", "s");
        backend
            .write(&session(), "world", 1, &value("a"), &owner)
            .await
            .unwrap();

        let outcome = backend
            .write(&session(), "world", 2, &value("b"), &WriterId::new("p2", "s"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Forbidden { owner });
        assert_eq!(backend.versions(&session(), "world").await, vec![1]);
    }

    #[tokio::test]
    async fn test_list_latest_is_per_session_and_sorted() {
        let backend = InMemoryArtifactBackend::new();
        let writer = WriterId::new("p", "s");
        let other = SessionKey::new("owner", "other-chat");

        backend.write(&session(), "b", 1, &value("b1"), &writer).await.unwrap();
        backend.write(&session(), "a", 1, &value("a1"), &writer).await.unwrap();
        backend.write(&session(), "a", 2, &value("a2"), &writer).await.unwrap();
        backend.write(&other, "c", 1, &value("c1"), &writer).await.unwrap();

        let latest = backend.list_latest(&session()).await.unwrap();
        let summary: Vec<_> = latest.iter().map(|s| (s.tag.as_str(), s.version)).collect();
        assert_eq!(summary, vec![("a", 2), ("b", 1)]);
    }

    #[tokio::test]
    async fn test_prune_below() {
        let backend = InMemoryArtifactBackend::new();
        let writer = WriterId::new("p", "s");
        for v in 1..=4 {
            backend
                .write(&session(), "world", v, &value("x"), &writer)
                .await
                .unwrap();
        }

        let removed = backend.prune_below(&session(), "world", 3).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.versions(&session(), "world").await, vec![3, 4]);
        assert_eq!(
            backend.prune_below(&session(), "missing", 3).await.unwrap(),
            0
        );
    }
}
