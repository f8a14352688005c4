//! Registry of in-flight runs and their cancellation tokens
//!
//! Lets an out-of-band signal (client disconnect, Ctrl-C) cancel a run by
//! id. A run is registered at start and removed when its guard drops,
//! whatever the outcome.

use hearth_core::{HearthError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-wide map of run id to cancellation token
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    runs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a run; fails if the id is already in flight
    pub fn register(&self, run_id: &str) -> Result<RegisteredRun> {
        let mut runs = self.runs();
        if runs.contains_key(run_id) {
            return Err(HearthError::RunAlreadyRegistered(run_id.to_string()));
        }
        let token = CancellationToken::new();
        runs.insert(run_id.to_string(), token.clone());
        debug!("Registered run {}", run_id);

        Ok(RegisteredRun {
            registry: self.clone(),
            run_id: run_id.to_string(),
            token,
        })
    }

    /// Remove a run; returns whether it was registered
    pub fn unregister(&self, run_id: &str) -> bool {
        self.runs().remove(run_id).is_some()
    }

    /// Cancel a run; returns whether it was registered
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered run
    pub fn cancel_all(&self) -> usize {
        let runs = self.runs();
        for token in runs.values() {
            token.cancel();
        }
        runs.len()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }
}

/// Registration of one run; unregisters on drop
#[derive(Debug)]
pub struct RegisteredRun {
    registry: CancellationRegistry,
    run_id: String,
    token: CancellationToken,
}

impl RegisteredRun {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RegisteredRun {
    fn drop(&mut self) {
        self.registry.unregister(&self.run_id);
        debug!("Unregistered run {}", self.run_id);
    }
}
