//! Ordered run event stream
//!
//! Every event of a run is wrapped with the run id and a sequence number
//! that starts at 1 and grows by one per emission. Sinks receive envelopes
//! in emission order.

use chrono::{DateTime, Utc};
use hearth_core::{ExecutionMode, GenerationTrigger, Hook};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::orchestrator::{SkipReason, TaskError, TaskObserver, TaskStatus};
use crate::state::{FailedType, FinishedStatus, RunPhase};

/// Everything a run reports while it executes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run.started")]
    RunStarted {
        trigger: GenerationTrigger,
        execution_mode: ExecutionMode,
    },
    #[serde(rename = "run.phase_changed")]
    PhaseChanged { phase: RunPhase },
    #[serde(rename = "operation.started")]
    OperationStarted { hook: Hook, op_id: String },
    #[serde(rename = "operation.finished")]
    OperationFinished {
        hook: Hook,
        op_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skip_reason: Option<SkipReason>,
    },
    #[serde(rename = "commit.effect_applied")]
    EffectApplied {
        hook: Hook,
        op_id: String,
        effect_type: String,
    },
    #[serde(rename = "commit.effect_skipped")]
    EffectSkipped {
        hook: Hook,
        op_id: String,
        effect_type: String,
        message: String,
    },
    #[serde(rename = "commit.effect_error")]
    EffectError {
        hook: Hook,
        op_id: String,
        effect_type: String,
        message: String,
    },
    #[serde(rename = "main_llm.started")]
    MainLlmStarted { message_count: usize },
    #[serde(rename = "main_llm.delta")]
    MainLlmDelta { text: String },
    #[serde(rename = "main_llm.finished")]
    MainLlmFinished {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "run.finished")]
    RunFinished {
        status: FinishedStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_type: Option<FailedType>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RunEvent {
    /// Dotted event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::PhaseChanged { .. } => "run.phase_changed",
            Self::OperationStarted { .. } => "operation.started",
            Self::OperationFinished { .. } => "operation.finished",
            Self::EffectApplied { .. } => "commit.effect_applied",
            Self::EffectSkipped { .. } => "commit.effect_skipped",
            Self::EffectError { .. } => "commit.effect_error",
            Self::MainLlmStarted { .. } => "main_llm.started",
            Self::MainLlmDelta { .. } => "main_llm.delta",
            Self::MainLlmFinished { .. } => "main_llm.finished",
            Self::RunFinished { .. } => "run.finished",
        }
    }
}

/// One emitted event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEventEnvelope {
    pub run_id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Receiver of run events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &RunEventEnvelope);
}

/// Forwards envelopes to an unbounded channel; a closed receiver is ignored
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<RunEventEnvelope>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        let _ = self.tx.send(envelope.clone());
    }
}

/// Keeps every envelope in memory
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<RunEventEnvelope>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEventEnvelope> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Event names in emission order
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event.name()).collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(envelope.clone());
        }
    }
}

/// Logs events through `tracing`; deltas go to debug
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        match &envelope.event {
            RunEvent::MainLlmDelta { text } => {
                debug!(run_id = %envelope.run_id, seq = envelope.seq, "delta {:?}", text)
            }
            event => info!(run_id = %envelope.run_id, seq = envelope.seq, "{}", event.name()),
        }
    }
}

/// Stamps events of one run and hands them to a sink
pub struct RunEmitter {
    run_id: String,
    seq: Mutex<u64>,
    sink: Arc<dyn EventSink>,
}

impl RunEmitter {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            seq: Mutex::new(0),
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit one event
    ///
    /// The sequence lock is held while the sink runs, so concurrent
    /// callers cannot deliver out of order.
    pub fn emit(&self, event: RunEvent) {
        let mut seq = self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *seq += 1;
        let envelope = RunEventEnvelope {
            run_id: self.run_id.clone(),
            seq: *seq,
            at: Utc::now(),
            event,
        };
        self.sink.emit(&envelope);
    }
}

/// Task observer that reports operation lifecycle for one hook
pub struct OperationEventObserver {
    emitter: Arc<RunEmitter>,
    hook: Hook,
}

impl OperationEventObserver {
    pub fn new(emitter: Arc<RunEmitter>, hook: Hook) -> Self {
        Self { emitter, hook }
    }
}

impl TaskObserver for OperationEventObserver {
    fn on_task_started(&self, task_id: &str) {
        self.emitter.emit(RunEvent::OperationStarted {
            hook: self.hook,
            op_id: task_id.to_string(),
        });
    }

    fn on_task_finished(&self, task_id: &str, status: TaskStatus, error: Option<&TaskError>) {
        self.emitter.emit(RunEvent::OperationFinished {
            hook: self.hook,
            op_id: task_id.to_string(),
            status,
            error: error.cloned(),
            skip_reason: None,
        });
    }

    fn on_task_skipped(&self, task_id: &str, reason: SkipReason) {
        self.emitter.emit(RunEvent::OperationFinished {
            hook: self.hook,
            op_id: task_id.to_string(),
            status: TaskStatus::Skipped,
            error: None,
            skip_reason: Some(reason),
        });
    }
}
