//! # hearth-runtime
//!
//! Generation run engine for Hearth.
//!
//! A run turns one user turn into one assistant turn. Template operations
//! run at two hooks around a single streamed LLM call; each renders to one
//! typed effect, and effects are committed to the run's state in a
//! deterministic order after an effect policy check.
//!
//! This crate provides:
//! - Operation configuration and graph validation
//! - Effects, their pure appliers and the hook policy table
//! - A dependency-aware task orchestrator (sequential or concurrent)
//! - Ancestor-only replay so sibling operations never see each other
//! - Execution and commit phases
//! - The run state machine with barriers, partial flushes and cancellation
//! - Ordered run events and a cancellation registry

mod cancellation;
mod commit;
mod effects;
mod events;
mod execution;
mod operations;
mod orchestrator;
mod persistence;
mod policy;
mod replay;
mod run;
mod state;
mod template;

pub use cancellation::{CancellationRegistry, RegisteredRun};
pub use commit::{
    commit_effects, commit_order, CommitContext, CommitOutcome, CommitPhaseReport, CommitStatus,
    CommittedEffect, EffectCommitStatus,
};
pub use effects::{
    append_after_last_user, apply_to_messages, insert_at_depth, replace_last_of_role, system_update,
    EffectKind, RuntimeEffect,
};
pub use events::{
    ChannelEventSink, CollectingEventSink, EventSink, OperationEventObserver, RunEmitter, RunEvent,
    RunEventEnvelope, TracingEventSink,
};
pub use execution::{ExecutionInput, OperationExecutionResult, OperationExecutor};
pub use operations::{
    select_operations, validate_operation_graph, GraphIssue, OperationConfig, OperationKind,
    OperationOutput, PromptTimeOutput, SystemUpdateMode, TurnTarget,
};
pub use orchestrator::{
    NoopObserver, OrchestratorTask, SkipReason, TaskError, TaskFuture, TaskObserver,
    TaskOrchestrator, TaskResult, TaskStatus,
};
pub use persistence::{FinalizeReport, FinalizedRun, InMemoryTurnPersistence, TurnPersistence, TurnRef};
pub use policy::{validate as validate_effect, PolicyViolation};
pub use replay::{replay, replay_order, resolve_ancestors, PreviewState};
pub use run::{GenerationRequest, GenerationRuntime, RunOutcome};
pub use state::{FailedType, FinishedStatus, PhaseReport, PhaseStatus, RunPhase, RunState};
pub use template::{build_context, MiniJinjaRenderer, RenderOptions, TemplateRenderer};
