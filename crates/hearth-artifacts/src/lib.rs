//! # hearth-artifacts
//!
//! Artifact stores for Hearth generation runs.
//!
//! An artifact is a named piece of run or session state that templates read
//! as `art.<tag>`. Two stores share the [`ArtifactValue`] contract:
//! - [`RunArtifactStore`]: in-memory, scoped to one run, discarded at run end
//! - [`PersistedArtifactStore`]: versioned, owner-checked writes through an
//!   [`ArtifactBackend`], with optimistic concurrency and retention pruning

mod backend;
mod memory;
mod persisted;
mod run_store;
mod value;

pub use backend::{ArtifactBackend, StoredArtifact, WriteOutcome};
pub use memory::InMemoryArtifactBackend;
pub use persisted::PersistedArtifactStore;
pub use run_store::RunArtifactStore;
pub use value::{ArtifactUpsert, ArtifactValue};
