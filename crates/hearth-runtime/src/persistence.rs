//! Turn persistence collaborator
//!
//! Stores the text of chat turns. The run rewrites turns through it during
//! commits, flushes partial assistant text while streaming, and hands it the
//! finished run exactly once.

use async_trait::async_trait;
use hearth_core::{HearthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::state::{FailedType, FinishedStatus, RunState};

/// Reference to a stored turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnRef {
    pub id: String,
}

impl TurnRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for TurnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Everything finalize receives about a finished run
#[derive(Debug, Clone, Copy)]
pub struct FinalizeReport<'a> {
    pub run_id: &'a str,
    pub status: FinishedStatus,
    pub failed_type: Option<FailedType>,
    pub message: Option<&'a str>,
    pub assistant_turn: &'a TurnRef,
    pub state: &'a RunState,
}

#[async_trait]
pub trait TurnPersistence: Send + Sync {
    /// Replace the stored text of a turn
    async fn replace_text(&self, turn: &TurnRef, text: &str) -> Result<()>;

    /// Store partial assistant text while the main LLM streams
    async fn flush_partial(&self, turn: &TurnRef, text: &str) -> Result<()>;

    /// Record the outcome of a run
    async fn finalize(&self, report: &FinalizeReport<'_>) -> Result<()>;
}

/// What finalize was told, kept by [`InMemoryTurnPersistence`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedRun {
    pub run_id: String,
    pub status: FinishedStatus,
    pub failed_type: Option<FailedType>,
    pub message: Option<String>,
    pub assistant_text: String,
}

#[derive(Debug, Default)]
struct Recorded {
    texts: HashMap<TurnRef, String>,
    flushes: Vec<String>,
    finalized: Vec<FinalizedRun>,
}

/// Turn store held in memory; used offline and in tests
#[derive(Debug, Default)]
pub struct InMemoryTurnPersistence {
    recorded: Mutex<Recorded>,
    fail_replace: bool,
}

impl InMemoryTurnPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `replace_text` call fails
    pub fn failing_replace() -> Self {
        Self {
            fail_replace: true,
            ..Self::default()
        }
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn text(&self, turn: &TurnRef) -> Option<String> {
        self.recorded().texts.get(turn).cloned()
    }

    /// Partial texts in flush order
    pub fn flushes(&self) -> Vec<String> {
        self.recorded().flushes.clone()
    }

    pub fn finalized(&self) -> Vec<FinalizedRun> {
        self.recorded().finalized.clone()
    }
}

#[async_trait]
impl TurnPersistence for InMemoryTurnPersistence {
    async fn replace_text(&self, turn: &TurnRef, text: &str) -> Result<()> {
        if self.fail_replace {
            return Err(HearthError::Persistence(format!("turn {} is read-only", turn)));
        }
        self.recorded().texts.insert(turn.clone(), text.to_string());
        Ok(())
    }

    async fn flush_partial(&self, turn: &TurnRef, text: &str) -> Result<()> {
        let mut recorded = self.recorded();
        recorded.texts.insert(turn.clone(), text.to_string());
        recorded.flushes.push(text.to_string());
        Ok(())
    }

    async fn finalize(&self, report: &FinalizeReport<'_>) -> Result<()> {
        let mut recorded = self.recorded();
        recorded
            .texts
            .insert(report.assistant_turn.clone(), report.state.assistant_text.clone());
        recorded.finalized.push(FinalizedRun {
            run_id: report.run_id.to_string(),
            status: report.status,
            failed_type: report.failed_type,
            message: report.message.map(str::to_string),
            assistant_text: report.state.assistant_text.clone(),
        });
        Ok(())
    }
}
