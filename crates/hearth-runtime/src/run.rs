//! Run state machine for one chat generation
//!
//! Phases run in a fixed order:
//!
//! ```text
//! prepare_run_context -> build_base_prompt -> execute_before_operations
//!   -> commit_before_effects -> before_barrier -> run_main_llm
//!   -> execute_after_operations -> commit_after_effects -> persist_finalize
//! ```
//!
//! Cancellation is checked at every phase boundary, inside the orchestrator
//! and inside the streaming loop. Whatever happens, finalize is invoked
//! exactly once and the event stream ends with exactly one `run.finished`.

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use hearth_artifacts::{ArtifactValue, PersistedArtifactStore, StoredArtifact};
use hearth_core::fail_open::fail_open;
use hearth_core::{
    ExecutionMode, GenerationSettings, GenerationTrigger, Hook, PromptMessage, Result, SessionKey,
};
use hearth_llm::{LlmClient, LlmRequest, StreamChunk};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancellation::CancellationRegistry;
use crate::commit::{commit_effects, CommitContext, CommitOutcome};
use crate::events::{EventSink, OperationEventObserver, RunEmitter, RunEvent, TracingEventSink};
use crate::execution::{ExecutionInput, OperationExecutionResult, OperationExecutor};
use crate::operations::{select_operations, validate_operation_graph, OperationConfig};
use crate::orchestrator::TaskStatus;
use crate::persistence::{FinalizeReport, TurnPersistence, TurnRef};
use crate::replay::PreviewState;
use crate::state::{FailedType, FinishedStatus, PhaseStatus, RunPhase, RunState};
use crate::template::TemplateRenderer;

/// Input of one generation run
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub run_id: String,
    pub session: SessionKey,
    pub pipeline_id: String,
    pub trigger: GenerationTrigger,
    pub system_prompt: String,
    /// Earlier turns of the chat, oldest first
    pub history: Vec<PromptMessage>,
    pub user_text: String,
    pub operations: Vec<OperationConfig>,
    /// Extra template variables
    pub vars: Map<String, Value>,
    /// Overrides the configured execution mode
    pub execution_mode: Option<ExecutionMode>,
    pub user_turn: TurnRef,
    pub assistant_turn: TurnRef,
}

impl GenerationRequest {
    pub fn new(session: SessionKey, user_text: impl Into<String>) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        Self {
            user_turn: TurnRef::new(format!("{}:user", run_id)),
            assistant_turn: TurnRef::new(format!("{}:assistant", run_id)),
            run_id,
            session,
            pipeline_id: "default".to_string(),
            trigger: GenerationTrigger::Generate,
            system_prompt: String::new(),
            history: Vec::new(),
            user_text: user_text.into(),
            operations: Vec::new(),
            vars: Map::new(),
            execution_mode: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_pipeline_id(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = pipeline_id.into();
        self
    }

    pub fn with_trigger(mut self, trigger: GenerationTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_history(mut self, history: Vec<PromptMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_operations(mut self, operations: Vec<OperationConfig>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn with_turns(mut self, user_turn: TurnRef, assistant_turn: TurnRef) -> Self {
        self.user_turn = user_turn;
        self.assistant_turn = assistant_turn;
        self
    }
}

/// Result of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: FinishedStatus,
    pub failed_type: Option<FailedType>,
    pub message: Option<String>,
    pub state: RunState,
}

/// Terminal verdict produced by the phases
struct Verdict {
    status: FinishedStatus,
    failed_type: Option<FailedType>,
    message: Option<String>,
}

impl Verdict {
    fn done() -> Self {
        Self {
            status: FinishedStatus::Done,
            failed_type: None,
            message: None,
        }
    }

    fn failed(failed_type: FailedType, message: String) -> Self {
        Self {
            status: FinishedStatus::Failed,
            failed_type: Some(failed_type),
            message: Some(message),
        }
    }

    fn aborted(message: String) -> Self {
        Self {
            status: FinishedStatus::Aborted,
            failed_type: None,
            message: Some(message),
        }
    }
}

enum StreamEnd {
    Completed,
    Cancelled,
    Failed(String),
}

/// Drives generation runs against a set of collaborators
pub struct GenerationRuntime {
    renderer: Arc<dyn TemplateRenderer>,
    llm: Arc<dyn LlmClient>,
    turns: Arc<dyn TurnPersistence>,
    persisted: Option<PersistedArtifactStore>,
    events: Arc<dyn EventSink>,
    registry: CancellationRegistry,
    settings: GenerationSettings,
    max_tokens: Option<u32>,
}

impl GenerationRuntime {
    pub fn new(
        renderer: Arc<dyn TemplateRenderer>,
        llm: Arc<dyn LlmClient>,
        turns: Arc<dyn TurnPersistence>,
    ) -> Self {
        Self {
            renderer,
            llm,
            turns,
            persisted: None,
            events: Arc::new(TracingEventSink),
            registry: CancellationRegistry::new(),
            settings: GenerationSettings::default(),
            max_tokens: None,
        }
    }

    pub fn with_persisted_store(mut self, store: PersistedArtifactStore) -> Self {
        self.persisted = Some(store);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_registry(mut self, registry: CancellationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// Run one generation end to end
    ///
    /// Fails only when the run id is already in flight; every later failure
    /// is reported through the outcome and the event stream.
    #[instrument(skip(self, request), fields(run_id = %request.run_id))]
    pub async fn run_chat_generation(&self, request: GenerationRequest) -> Result<RunOutcome> {
        let registration = self.registry.register(&request.run_id)?;
        let cancel = registration.token();
        let emitter = Arc::new(RunEmitter::new(request.run_id.clone(), self.events.clone()));
        let mode = request.execution_mode.unwrap_or(self.settings.execution_mode);
        let mut state = RunState::default();

        info!("Starting run {} ({}, {})", request.run_id, request.trigger, mode);
        emitter.emit(RunEvent::RunStarted {
            trigger: request.trigger,
            execution_mode: mode,
        });

        let driven = AssertUnwindSafe(self.drive(&request, mode, &mut state, &emitter, &cancel))
            .catch_unwind()
            .await;

        let verdict = match driven {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => unexpected(&cancel, e.to_string()),
            Err(panic) => unexpected(&cancel, format!("run panicked: {}", panic_message(panic.as_ref()))),
        };

        let started = self.enter(&emitter, RunPhase::PersistFinalize);
        state.finished_status = Some(verdict.status);
        state.failed_type = verdict.failed_type;
        let finalized = self
            .turns
            .finalize(&FinalizeReport {
                run_id: &request.run_id,
                status: verdict.status,
                failed_type: verdict.failed_type,
                message: verdict.message.as_deref(),
                assistant_turn: &request.assistant_turn,
                state: &state,
            })
            .await;
        match finalized {
            Ok(()) => state.record_phase(RunPhase::PersistFinalize, PhaseStatus::Done, started, None),
            Err(e) => {
                warn!("Finalize of run {} failed: {}", request.run_id, e);
                state.record_phase(
                    RunPhase::PersistFinalize,
                    PhaseStatus::Failed,
                    started,
                    Some(e.to_string()),
                );
            }
        }

        emitter.emit(RunEvent::RunFinished {
            status: verdict.status,
            failed_type: verdict.failed_type,
            message: verdict.message.clone(),
        });
        info!("Run {} finished: {}", request.run_id, verdict.status);

        drop(registration);
        Ok(RunOutcome {
            run_id: request.run_id,
            status: verdict.status,
            failed_type: verdict.failed_type,
            message: verdict.message,
            state,
        })
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        mode: ExecutionMode,
        state: &mut RunState,
        emitter: &Arc<RunEmitter>,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        // prepare_run_context
        if let Some(verdict) = self.check_cancel(state, RunPhase::PrepareRunContext, cancel) {
            return Ok(verdict);
        }
        let started = self.enter(emitter, RunPhase::PrepareRunContext);
        for issue in validate_operation_graph(&request.operations) {
            warn!("Operation graph: {}", issue);
        }
        let before_ops = select_operations(&request.operations, Hook::BeforeMainLlm, request.trigger);
        let after_ops = select_operations(&request.operations, Hook::AfterMainLlm, request.trigger);
        match self.load_snapshot(&request.session).await {
            Ok(snapshot) => state.persisted_artifacts_snapshot = snapshot,
            Err(e) => {
                state.record_phase(
                    RunPhase::PrepareRunContext,
                    PhaseStatus::Failed,
                    started,
                    Some(e.to_string()),
                );
                return Err(e);
            }
        }
        state.user_text = request.user_text.clone();
        state.record_phase(RunPhase::PrepareRunContext, PhaseStatus::Done, started, None);

        // build_base_prompt
        if let Some(verdict) = self.check_cancel(state, RunPhase::BuildBasePrompt, cancel) {
            return Ok(verdict);
        }
        let started = self.enter(emitter, RunPhase::BuildBasePrompt);
        state.base_prompt_draft = build_base_prompt(request);
        state.effective_prompt_draft = state.base_prompt_draft.clone();
        state.record_phase(RunPhase::BuildBasePrompt, PhaseStatus::Done, started, None);

        // execute_before_operations + commit_before_effects
        let base = PreviewState {
            messages: state.base_prompt_draft.clone(),
            artifacts: visible_artifacts(state),
            user_text: state.user_text.clone(),
            assistant_text: String::new(),
        };
        let committed = match self
            .run_hook(Hook::BeforeMainLlm, &before_ops, base, request, mode, state, emitter, cancel)
            .await
        {
            Ok(committed) => committed,
            Err(verdict) => return Ok(verdict),
        };

        // before_barrier
        if let Some(verdict) = self.check_cancel(state, RunPhase::BeforeBarrier, cancel) {
            return Ok(verdict);
        }
        let started = self.enter(emitter, RunPhase::BeforeBarrier);
        if let Some(message) = barrier_failure(state, Hook::BeforeMainLlm, &committed) {
            info!("Before barrier failed: {}", message);
            state.record_phase(
                RunPhase::BeforeBarrier,
                PhaseStatus::Failed,
                started,
                Some(message.clone()),
            );
            return Ok(Verdict::failed(FailedType::BeforeBarrier, message));
        }
        state.record_phase(RunPhase::BeforeBarrier, PhaseStatus::Done, started, None);

        // run_main_llm
        if let Some(verdict) = self.check_cancel(state, RunPhase::RunMainLlm, cancel) {
            return Ok(verdict);
        }
        let started = self.enter(emitter, RunPhase::RunMainLlm);
        let end = self.stream_main_llm(request, state, emitter, cancel).await;
        match end {
            StreamEnd::Completed => {
                emitter.emit(RunEvent::MainLlmFinished {
                    status: "done".to_string(),
                    message: None,
                });
                state.record_phase(RunPhase::RunMainLlm, PhaseStatus::Done, started, None);
            }
            StreamEnd::Cancelled => {
                let message = "cancelled during main LLM call".to_string();
                emitter.emit(RunEvent::MainLlmFinished {
                    status: "aborted".to_string(),
                    message: Some(message.clone()),
                });
                state.record_phase(
                    RunPhase::RunMainLlm,
                    PhaseStatus::Aborted,
                    started,
                    Some(message.clone()),
                );
                return Ok(Verdict::aborted(message));
            }
            StreamEnd::Failed(message) => {
                emitter.emit(RunEvent::MainLlmFinished {
                    status: "error".to_string(),
                    message: Some(message.clone()),
                });
                state.record_phase(
                    RunPhase::RunMainLlm,
                    PhaseStatus::Failed,
                    started,
                    Some(message.clone()),
                );
                return Ok(Verdict::failed(FailedType::MainLlm, message));
            }
        }

        // execute_after_operations + commit_after_effects
        let mut messages = state.effective_prompt_draft.clone();
        messages.push(PromptMessage::assistant(state.assistant_text.clone()));
        let base = PreviewState {
            messages,
            artifacts: visible_artifacts(state),
            user_text: state.user_text.clone(),
            assistant_text: state.assistant_text.clone(),
        };
        let committed = match self
            .run_hook(Hook::AfterMainLlm, &after_ops, base, request, mode, state, emitter, cancel)
            .await
        {
            Ok(committed) => committed,
            Err(verdict) => return Ok(verdict),
        };

        if let Some(message) = barrier_failure(state, Hook::AfterMainLlm, &committed) {
            info!("After barrier failed: {}", message);
            return Ok(Verdict::failed(FailedType::AfterMainLlm, message));
        }

        Ok(Verdict::done())
    }

    /// Execute then commit one hook; `Err` carries an abort verdict
    #[allow(clippy::too_many_arguments)]
    async fn run_hook(
        &self,
        hook: Hook,
        operations: &[OperationConfig],
        base: PreviewState,
        request: &GenerationRequest,
        mode: ExecutionMode,
        state: &mut RunState,
        emitter: &Arc<RunEmitter>,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommitOutcome, Verdict> {
        let (execute_phase, commit_phase) = match hook {
            Hook::BeforeMainLlm => (RunPhase::ExecuteBeforeOperations, RunPhase::CommitBeforeEffects),
            Hook::AfterMainLlm => (RunPhase::ExecuteAfterOperations, RunPhase::CommitAfterEffects),
        };

        if let Some(verdict) = self.check_cancel(state, execute_phase, cancel) {
            return Err(verdict);
        }
        let started = self.enter(emitter, execute_phase);
        let executor = OperationExecutor::new(self.renderer.clone(), cancel.clone())
            .with_observer(Arc::new(OperationEventObserver::new(emitter.clone(), hook)));
        let results = executor
            .execute(ExecutionInput {
                hook,
                operations,
                base,
                vars: request.vars.clone(),
                mode,
                strict_variables: self.settings.strict_variables,
            })
            .await;
        debug!("{} produced {} results", hook, results.len());
        state.operation_results_by_hook.insert(hook, results.clone());

        if cancel.is_cancelled() {
            let message = format!("cancelled during {}", execute_phase);
            state.record_phase(execute_phase, PhaseStatus::Aborted, started, Some(message.clone()));
            return Err(Verdict::aborted(message));
        }
        state.record_phase(execute_phase, PhaseStatus::Done, started, None);

        if let Some(verdict) = self.check_cancel(state, commit_phase, cancel) {
            return Err(verdict);
        }
        let started = self.enter(emitter, commit_phase);
        let ctx = CommitContext {
            hook,
            persisted: self.persisted.as_ref(),
            session: &request.session,
            pipeline_id: &request.pipeline_id,
            turns: self.turns.as_ref(),
            user_turn: &request.user_turn,
            assistant_turn: &request.assistant_turn,
            emitter: emitter.as_ref(),
        };
        let committed = commit_effects(&ctx, state, &results).await;
        state
            .commit_reports_by_hook
            .insert(hook, committed.report.clone());

        if committed.required_error {
            state.record_phase(
                commit_phase,
                PhaseStatus::Failed,
                started,
                Some("an effect of a required operation failed".to_string()),
            );
        } else {
            state.record_phase(commit_phase, PhaseStatus::Done, started, None);
        }
        Ok(committed)
    }

    async fn stream_main_llm(
        &self,
        request: &GenerationRequest,
        state: &mut RunState,
        emitter: &RunEmitter,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        emitter.emit(RunEvent::MainLlmStarted {
            message_count: state.effective_prompt_draft.len(),
        });
        let llm_request =
            LlmRequest::new(state.effective_prompt_draft.clone()).with_max_tokens(self.max_tokens);

        let mut stream = match self.llm.stream(llm_request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(_) if cancel.is_cancelled() => return StreamEnd::Cancelled,
            Err(e) => return StreamEnd::Failed(e.to_string()),
        };

        let period = Duration::from_millis(self.settings.flush_interval_ms.max(1));
        let mut flush = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flushed_len = 0;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                chunk = stream.next() => match chunk {
                    Some(StreamChunk::Delta(text)) => {
                        state.assistant_text.push_str(&text);
                        emitter.emit(RunEvent::MainLlmDelta { text });
                    }
                    Some(StreamChunk::Error(message)) => break StreamEnd::Failed(message),
                    None if cancel.is_cancelled() => break StreamEnd::Cancelled,
                    None => break StreamEnd::Completed,
                },
                _ = flush.tick() => {
                    if state.assistant_text.len() != flushed_len {
                        flushed_len = state.assistant_text.len();
                        fail_open(
                            "flush_partial",
                            self.turns.flush_partial(&request.assistant_turn, &state.assistant_text),
                        )
                        .await;
                    }
                }
            }
        };

        // Always flush what arrived, even when the stream was cut short
        fail_open(
            "flush_partial",
            self.turns
                .flush_partial(&request.assistant_turn, &state.assistant_text),
        )
        .await;
        end
    }

    async fn load_snapshot(&self, session: &SessionKey) -> Result<BTreeMap<String, StoredArtifact>> {
        match &self.persisted {
            Some(store) => store.snapshot(session).await,
            None => Ok(BTreeMap::new()),
        }
    }

    fn enter(&self, emitter: &RunEmitter, phase: RunPhase) -> DateTime<Utc> {
        debug!("Entering phase {}", phase);
        emitter.emit(RunEvent::PhaseChanged { phase });
        Utc::now()
    }

    fn check_cancel(
        &self,
        state: &mut RunState,
        phase: RunPhase,
        cancel: &CancellationToken,
    ) -> Option<Verdict> {
        if !cancel.is_cancelled() {
            return None;
        }
        let message = format!("cancelled before {}", phase);
        info!("{}", message);
        state.record_phase(phase, PhaseStatus::Aborted, Utc::now(), Some(message.clone()));
        Some(Verdict::aborted(message))
    }
}

/// System prompt, history, then the new user turn
fn build_base_prompt(request: &GenerationRequest) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if !request.system_prompt.is_empty() {
        messages.push(PromptMessage::system(request.system_prompt.clone()));
    }
    messages.extend(request.history.iter().cloned());
    if !request.user_text.is_empty() {
        messages.push(PromptMessage::user(request.user_text.clone()));
    }
    messages
}

/// Persisted snapshot overlaid by run-only artifacts
fn visible_artifacts(state: &RunState) -> BTreeMap<String, ArtifactValue> {
    let mut artifacts: BTreeMap<String, ArtifactValue> = state
        .persisted_artifacts_snapshot
        .iter()
        .map(|(tag, stored)| (tag.clone(), stored.value.clone()))
        .collect();
    for (tag, value) in state.run_artifacts.iter() {
        artifacts.insert(tag.clone(), value.clone());
    }
    artifacts
}

/// Why a hook's barrier fails, if it does
fn barrier_failure(state: &RunState, hook: Hook, committed: &CommitOutcome) -> Option<String> {
    let not_done: Vec<&str> = state
        .operation_results_by_hook
        .get(&hook)
        .into_iter()
        .flatten()
        .filter(|r| r.required && r.status != TaskStatus::Done)
        .map(|r: &OperationExecutionResult| r.op_id.as_str())
        .collect();

    if !not_done.is_empty() {
        return Some(format!(
            "required {} operations did not finish: {}",
            hook,
            not_done.join(", ")
        ));
    }
    if committed.required_error {
        return Some(format!("required {} effects failed to commit", hook));
    }
    None
}

fn unexpected(cancel: &CancellationToken, message: String) -> Verdict {
    warn!("Run stopped unexpectedly: {}", message);
    Verdict {
        status: if cancel.is_cancelled() {
            FinishedStatus::Aborted
        } else {
            FinishedStatus::Error
        },
        failed_type: None,
        message: Some(message),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
