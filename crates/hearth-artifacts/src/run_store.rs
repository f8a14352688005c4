//! In-memory artifact store scoped to one run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::{ArtifactUpsert, ArtifactValue};

/// Run-only artifacts keyed by tag
///
/// Iteration order is the tag order, so snapshots and template contexts
/// built from this store are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunArtifactStore {
    entries: BTreeMap<String, ArtifactValue>,
}

impl RunArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value; the first write seeds history, later writes append
    pub fn upsert(&mut self, upsert: &ArtifactUpsert) -> &ArtifactValue {
        let next = ArtifactValue::next(self.entries.get(&upsert.tag), upsert);
        self.entries.insert(upsert.tag.clone(), next);
        &self.entries[&upsert.tag]
    }

    pub fn get(&self, tag: &str) -> Option<&ArtifactValue> {
        self.entries.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, ArtifactValue> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArtifactValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
