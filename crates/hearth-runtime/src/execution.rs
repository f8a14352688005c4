//! Operation execution phase
//!
//! Adapts the task orchestrator to template operations. Each task renders
//! against a preview built from the base state plus the recorded effects of
//! its transitive ancestors, so what a task sees never depends on which
//! sibling happened to finish first.

use hearth_core::{ExecutionMode, Hook};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::effects::RuntimeEffect;
use crate::operations::{OperationConfig, OperationKind};
use crate::orchestrator::{
    OrchestratorTask, SkipReason, TaskError, TaskObserver, TaskOrchestrator, TaskResult, TaskStatus,
};
use crate::replay::{replay, replay_order, resolve_ancestors, PreviewState};
use crate::template::{build_context, RenderOptions, TemplateRenderer};

/// Outcome of one operation within one hook invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationExecutionResult {
    pub op_id: String,
    pub order: i32,
    pub depends_on: Vec<String>,
    pub required: bool,
    pub status: TaskStatus,
    /// Exactly one effect when `done`, empty otherwise
    pub effects: Vec<RuntimeEffect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl From<TaskResult<RuntimeEffect>> for OperationExecutionResult {
    fn from(result: TaskResult<RuntimeEffect>) -> Self {
        Self {
            op_id: result.task_id,
            order: result.order,
            depends_on: result.depends_on,
            required: result.required,
            status: result.status,
            effects: result.output.into_iter().collect(),
            error: result.error,
            skip_reason: result.skip_reason,
        }
    }
}

/// Inputs for one hook invocation
pub struct ExecutionInput<'a> {
    pub hook: Hook,
    /// Operations already filtered to this hook and trigger
    pub operations: &'a [OperationConfig],
    pub base: PreviewState,
    pub vars: Map<String, Value>,
    pub mode: ExecutionMode,
    /// Used for operations that do not set their own
    pub strict_variables: bool,
}

/// Runs template operations for a hook
pub struct OperationExecutor {
    renderer: Arc<dyn TemplateRenderer>,
    cancel: CancellationToken,
    observer: Option<Arc<dyn TaskObserver>>,
}

impl OperationExecutor {
    pub fn new(renderer: Arc<dyn TemplateRenderer>, cancel: CancellationToken) -> Self {
        Self {
            renderer,
            cancel,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Execute every operation to a terminal status
    ///
    /// Never fails: render errors become `error` results. Results are
    /// sorted by `(order, op_id)`.
    #[instrument(skip(self, input), fields(hook = %input.hook, operations = input.operations.len()))]
    pub async fn execute(&self, input: ExecutionInput<'_>) -> Vec<OperationExecutionResult> {
        let graph: Arc<BTreeMap<String, Vec<String>>> = Arc::new(
            input
                .operations
                .iter()
                .map(|op| (op.op_id.clone(), op.depends_on.clone()))
                .collect(),
        );
        let orders: Arc<BTreeMap<String, i32>> = Arc::new(
            input
                .operations
                .iter()
                .map(|op| (op.op_id.clone(), op.order))
                .collect(),
        );
        let base = Arc::new(input.base);
        let vars = Arc::new(input.vars);
        let recorded: Arc<Mutex<BTreeMap<String, RuntimeEffect>>> = Arc::default();

        let mut results = Vec::new();
        let mut tasks = Vec::new();

        for op in input.operations {
            if op.kind != OperationKind::Template {
                debug!("Operation {} has kind {:?}, not executing", op.op_id, op.kind);
                if let Some(observer) = &self.observer {
                    observer.on_task_skipped(&op.op_id, SkipReason::UnsupportedKind);
                }
                results.push(OperationExecutionResult {
                    op_id: op.op_id.clone(),
                    order: op.order,
                    depends_on: op.depends_on.clone(),
                    required: op.required,
                    status: TaskStatus::Skipped,
                    effects: Vec::new(),
                    error: None,
                    skip_reason: Some(SkipReason::UnsupportedKind),
                });
                continue;
            }

            let strict_variables = op.strict_variables.unwrap_or(input.strict_variables);
            let op_for_task = op.clone();
            let renderer = self.renderer.clone();
            let graph = graph.clone();
            let orders = orders.clone();
            let base = base.clone();
            let vars = vars.clone();
            let recorded = recorded.clone();

            let task = OrchestratorTask::new(op.op_id.clone(), move || {
                Box::pin(async move {
                    let op = op_for_task;
                    let ancestors = resolve_ancestors(&op.op_id, &graph);
                    let replay_ids = replay_order(&ancestors, &graph, &orders);
                    let preview = {
                        let effects = recorded.lock().unwrap_or_else(|p| p.into_inner());
                        replay(&base, &replay_ids, &effects)
                    };

                    let context = build_context(&preview, &vars);
                    let rendered = renderer.render(
                        &op.template,
                        &context,
                        RenderOptions { strict_variables },
                    )?;
                    let effect = RuntimeEffect::from_output(&op.op_id, &op.output, rendered);

                    recorded
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(op.op_id.clone(), effect.clone());
                    Ok::<_, TaskError>(effect)
                })
            })
            .with_order(op.order)
            .with_depends_on(op.depends_on.clone())
            .with_required(op.required)
            .with_enabled(op.enabled);
            tasks.push(task);
        }

        let mut orchestrator = TaskOrchestrator::new(input.mode, self.cancel.clone());
        if let Some(observer) = &self.observer {
            orchestrator = orchestrator.with_observer(observer.clone());
        }

        results.extend(
            orchestrator
                .run(tasks)
                .await
                .into_iter()
                .map(OperationExecutionResult::from),
        );
        results.sort_by(|a, b| (a.order, &a.op_id).cmp(&(b.order, &b.op_id)));
        results
    }
}
