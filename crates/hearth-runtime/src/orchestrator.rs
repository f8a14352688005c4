//! Dependency-aware task orchestrator
//!
//! Runs named tasks either strictly one at a time in `(order, task_id)`
//! order, or concurrently with every task starting as soon as all of its
//! dependencies have settled. Either way a task only runs when every
//! dependency finished `done`; otherwise it is skipped, and the skip
//! propagates to its own dependents.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use hearth_core::{ExecutionMode, HearthError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal status of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Done,
    Error,
    Aborted,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a task never ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// A dependency is missing, cyclic, or settled without `done`
    DependencyNotDone,
    /// Another task with the same id was scheduled first
    DuplicateId,
    /// The operation kind has no executor
    UnsupportedKind,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::DependencyNotDone => "dependency_not_done",
            Self::DuplicateId => "duplicate_id",
            Self::UnsupportedKind => "unsupported_kind",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<HearthError> for TaskError {
    fn from(e: HearthError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type TaskFuture<T> = BoxFuture<'static, Result<T, TaskError>>;

/// A unit of work; `run` is only called if the task actually starts
pub struct OrchestratorTask<T> {
    pub task_id: String,
    pub order: i32,
    pub depends_on: Vec<String>,
    pub required: bool,
    pub enabled: bool,
    run: Box<dyn FnOnce() -> TaskFuture<T> + Send>,
}

impl<T> OrchestratorTask<T> {
    pub fn new<F>(task_id: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> TaskFuture<T> + Send + 'static,
    {
        Self {
            task_id: task_id.into(),
            order: 0,
            depends_on: Vec::new(),
            required: false,
            enabled: true,
            run: Box::new(run),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn sort_key(&self) -> (i32, String) {
        (self.order, self.task_id.clone())
    }
}

impl<T> std::fmt::Debug for OrchestratorTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorTask")
            .field("task_id", &self.task_id)
            .field("order", &self.order)
            .field("depends_on", &self.depends_on)
            .field("required", &self.required)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Terminal record of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub order: i32,
    pub depends_on: Vec<String>,
    pub required: bool,
    pub status: TaskStatus,
    pub output: Option<T>,
    pub error: Option<TaskError>,
    pub skip_reason: Option<SkipReason>,
}

impl<T> TaskResult<T> {
    fn settled<U>(task: &OrchestratorTask<U>, status: TaskStatus) -> Self {
        Self {
            task_id: task.task_id.clone(),
            order: task.order,
            depends_on: task.depends_on.clone(),
            required: task.required,
            status,
            output: None,
            error: None,
            skip_reason: None,
        }
    }
}

/// Callbacks for task lifecycle transitions
///
/// Called from the orchestrating task, never from inside task futures.
pub trait TaskObserver: Send + Sync {
    fn on_task_started(&self, _task_id: &str) {}

    fn on_task_finished(&self, _task_id: &str, _status: TaskStatus, _error: Option<&TaskError>) {}

    fn on_task_skipped(&self, _task_id: &str, _reason: SkipReason) {}
}

/// Observer that ignores every callback
#[derive(Debug, Default)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {}

/// Executes a set of tasks for one hook invocation
pub struct TaskOrchestrator {
    mode: ExecutionMode,
    cancel: CancellationToken,
    observer: Arc<dyn TaskObserver>,
}

impl TaskOrchestrator {
    pub fn new(mode: ExecutionMode, cancel: CancellationToken) -> Self {
        Self {
            mode,
            cancel,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run every task to a terminal status
    ///
    /// Results are sorted by `(order, task_id)` regardless of completion
    /// order. Task failures never escape; they become `error` results.
    pub async fn run<T: Send + 'static>(&self, tasks: Vec<OrchestratorTask<T>>) -> Vec<TaskResult<T>> {
        let (tasks, mut results) = self.split_duplicates(tasks);

        let mut settled = match self.mode {
            ExecutionMode::Sequential => self.run_sequential(tasks).await,
            ExecutionMode::Concurrent => self.run_concurrent(tasks).await,
        };
        results.append(&mut settled);
        results.sort_by(|a, b| (a.order, &a.task_id).cmp(&(b.order, &b.task_id)));
        results
    }

    fn split_duplicates<T>(
        &self,
        tasks: Vec<OrchestratorTask<T>>,
    ) -> (Vec<OrchestratorTask<T>>, Vec<TaskResult<T>>) {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(tasks.len());
        let mut duplicates = Vec::new();

        for task in tasks {
            if seen.insert(task.task_id.clone()) {
                unique.push(task);
            } else {
                warn!("Duplicate task id {}, skipping", task.task_id);
                duplicates.push(self.skip(&task, SkipReason::DuplicateId));
            }
        }
        (unique, duplicates)
    }

    async fn run_sequential<T: Send + 'static>(
        &self,
        mut tasks: Vec<OrchestratorTask<T>>,
    ) -> Vec<TaskResult<T>> {
        tasks.sort_by_key(|t| t.sort_key());
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut results = Vec::with_capacity(tasks.len());

        for task in tasks {
            let result = if !task.enabled {
                self.skip(&task, SkipReason::Disabled)
            } else if !task
                .depends_on
                .iter()
                .all(|d| statuses.get(d) == Some(&TaskStatus::Done))
            {
                self.skip(&task, SkipReason::DependencyNotDone)
            } else if self.cancel.is_cancelled() {
                self.abort(&task)
            } else {
                self.observer.on_task_started(&task.task_id);
                let mut result = TaskResult::settled(&task, TaskStatus::Done);
                let outcome = tokio::spawn((task.run)()).await;
                self.finish(&mut result, outcome);
                result
            };
            statuses.insert(result.task_id.clone(), result.status);
            results.push(result);
        }
        results
    }

    async fn run_concurrent<T: Send + 'static>(
        &self,
        tasks: Vec<OrchestratorTask<T>>,
    ) -> Vec<TaskResult<T>> {
        let known: HashSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        let mut pending: BTreeMap<(i32, String), OrchestratorTask<T>> =
            tasks.into_iter().map(|t| (t.sort_key(), t)).collect();
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut in_flight: HashMap<String, TaskResult<T>> = HashMap::new();
        let mut running: FuturesUnordered<BoxFuture<'static, (String, Result<Result<T, TaskError>, JoinError>)>> =
            FuturesUnordered::new();
        let mut results = Vec::new();

        loop {
            // Settle skips until nothing changes; skips can cascade
            loop {
                let mut newly_skipped = Vec::new();
                for (key, task) in &pending {
                    let reason = if !task.enabled {
                        Some(SkipReason::Disabled)
                    } else if task.depends_on.iter().any(|d| {
                        !known.contains(d)
                            || matches!(statuses.get(d), Some(s) if *s != TaskStatus::Done)
                    }) {
                        Some(SkipReason::DependencyNotDone)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        newly_skipped.push((key.clone(), reason));
                    }
                }
                if newly_skipped.is_empty() {
                    break;
                }
                for (key, reason) in newly_skipped {
                    if let Some(task) = pending.remove(&key) {
                        let result = self.skip(&task, reason);
                        statuses.insert(result.task_id.clone(), result.status);
                        results.push(result);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                for (_, task) in std::mem::take(&mut pending) {
                    let result = self.abort(&task);
                    statuses.insert(result.task_id.clone(), result.status);
                    results.push(result);
                }
            }

            let ready: Vec<(i32, String)> = pending
                .iter()
                .filter(|(_, t)| {
                    t.depends_on
                        .iter()
                        .all(|d| statuses.get(d) == Some(&TaskStatus::Done))
                })
                .map(|(k, _)| k.clone())
                .collect();

            for key in ready {
                let Some(task) = pending.remove(&key) else { continue };
                self.observer.on_task_started(&task.task_id);
                debug!("Starting task {}", task.task_id);

                let task_id = task.task_id.clone();
                in_flight.insert(task_id.clone(), TaskResult::settled(&task, TaskStatus::Done));
                let handle = tokio::spawn((task.run)());
                running.push(Box::pin(async move { (task_id, handle.await) }));
            }

            if running.is_empty() {
                if pending.is_empty() {
                    break;
                }
                // Nothing can ever settle the rest: they wait on a cycle
                for (_, task) in std::mem::take(&mut pending) {
                    let result = self.skip(&task, SkipReason::DependencyNotDone);
                    statuses.insert(result.task_id.clone(), result.status);
                    results.push(result);
                }
                continue;
            }

            if let Some((task_id, outcome)) = running.next().await {
                if let Some(mut result) = in_flight.remove(&task_id) {
                    self.finish(&mut result, outcome);
                    statuses.insert(task_id, result.status);
                    results.push(result);
                }
            }
        }

        results
    }

    fn skip<T, U>(&self, task: &OrchestratorTask<U>, reason: SkipReason) -> TaskResult<T> {
        debug!("Skipping task {}: {}", task.task_id, reason);
        self.observer.on_task_skipped(&task.task_id, reason);
        let mut result = TaskResult::settled(task, TaskStatus::Skipped);
        result.skip_reason = Some(reason);
        result
    }

    fn abort<T, U>(&self, task: &OrchestratorTask<U>) -> TaskResult<T> {
        debug!("Aborting unstarted task {}", task.task_id);
        let result = TaskResult::settled(task, TaskStatus::Aborted);
        self.observer
            .on_task_finished(&task.task_id, TaskStatus::Aborted, None);
        result
    }

    fn finish<T>(&self, result: &mut TaskResult<T>, outcome: Result<Result<T, TaskError>, JoinError>) {
        match outcome {
            Ok(Ok(output)) => {
                result.status = TaskStatus::Done;
                result.output = Some(output);
            }
            Ok(Err(error)) if self.cancel.is_cancelled() => {
                result.status = TaskStatus::Aborted;
                result.error = Some(error);
            }
            Ok(Err(error)) => {
                result.status = TaskStatus::Error;
                result.error = Some(error);
            }
            Err(join_error) if join_error.is_panic() => {
                warn!("Task {} panicked", result.task_id);
                result.status = TaskStatus::Error;
                result.error = Some(TaskError::new(
                    "task_panicked",
                    format!("task {} panicked", result.task_id),
                ));
            }
            Err(_) => {
                result.status = TaskStatus::Aborted;
            }
        }

        debug!("Task {} finished: {}", result.task_id, result.status);
        self.observer
            .on_task_finished(&result.task_id, result.status, result.error.as_ref());
    }
}
