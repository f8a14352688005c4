//! Run state, phases and reports

use chrono::{DateTime, Utc};
use hearth_artifacts::{RunArtifactStore, StoredArtifact};
use hearth_core::{Hook, PromptMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::commit::CommitPhaseReport;
use crate::execution::OperationExecutionResult;

/// Named phases of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    PrepareRunContext,
    BuildBasePrompt,
    ExecuteBeforeOperations,
    CommitBeforeEffects,
    BeforeBarrier,
    RunMainLlm,
    ExecuteAfterOperations,
    CommitAfterEffects,
    PersistFinalize,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrepareRunContext => "prepare_run_context",
            Self::BuildBasePrompt => "build_base_prompt",
            Self::ExecuteBeforeOperations => "execute_before_operations",
            Self::CommitBeforeEffects => "commit_before_effects",
            Self::BeforeBarrier => "before_barrier",
            Self::RunMainLlm => "run_main_llm",
            Self::ExecuteAfterOperations => "execute_after_operations",
            Self::CommitAfterEffects => "commit_after_effects",
            Self::PersistFinalize => "persist_finalize",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Done,
    Failed,
    Aborted,
}

/// Audit record of one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: RunPhase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedStatus {
    Done,
    Failed,
    Aborted,
    /// An unexpected error escaped a phase
    Error,
}

impl std::fmt::Display for FinishedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which gate failed a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedType {
    BeforeBarrier,
    MainLlm,
    AfterMainLlm,
}

/// Mutable aggregate owned by one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    /// Snapshot taken once the base prompt is built; never mutated after
    pub base_prompt_draft: Vec<PromptMessage>,
    /// Draft actually sent to the main LLM
    pub effective_prompt_draft: Vec<PromptMessage>,
    pub user_text: String,
    pub assistant_text: String,
    pub run_artifacts: RunArtifactStore,
    pub persisted_artifacts_snapshot: BTreeMap<String, StoredArtifact>,
    pub operation_results_by_hook: BTreeMap<Hook, Vec<OperationExecutionResult>>,
    pub commit_reports_by_hook: BTreeMap<Hook, CommitPhaseReport>,
    pub phase_reports: Vec<PhaseReport>,
    pub finished_status: Option<FinishedStatus>,
    pub failed_type: Option<FailedType>,
}

impl RunState {
    /// Report of a phase, if it ran
    pub fn phase(&self, phase: RunPhase) -> Option<&PhaseReport> {
        self.phase_reports.iter().find(|r| r.phase == phase)
    }

    pub fn record_phase(
        &mut self,
        phase: RunPhase,
        status: PhaseStatus,
        started_at: DateTime<Utc>,
        message: Option<String>,
    ) {
        self.phase_reports.push(PhaseReport {
            phase,
            status,
            started_at,
            finished_at: Utc::now(),
            message,
        });
    }
}
