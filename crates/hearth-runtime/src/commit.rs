//! Commit phase: deterministic, policy-checked application of effects
//!
//! Only `done` results are committed. Their order is a stable topological
//! sort over the done subset with ties broken by `(order, op_id)`, so the
//! committed state never depends on completion timing. Every failure is
//! captured in the report; the phase itself never fails.

use hearth_artifacts::{ArtifactUpsert, PersistedArtifactStore};
use hearth_core::{HearthError, Hook, Persistence, Result, SessionKey, WriterId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, warn};

use crate::effects::{apply_to_messages, EffectKind, RuntimeEffect};
use crate::events::{RunEmitter, RunEvent};
use crate::execution::OperationExecutionResult;
use crate::orchestrator::TaskStatus;
use crate::persistence::{TurnPersistence, TurnRef};
use crate::policy;
use crate::state::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectCommitStatus {
    Applied,
    Skipped,
    Error,
}

/// Commit record of one effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEffect {
    pub op_id: String,
    pub effect_type: String,
    pub status: EffectCommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPhaseReport {
    pub hook: Hook,
    /// `error` iff an effect of a required operation failed
    pub status: CommitStatus,
    pub effects: Vec<CommittedEffect>,
}

/// Report plus whether a required operation's effect failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub report: CommitPhaseReport,
    pub required_error: bool,
}

/// Done results in commit order
///
/// Kahn's algorithm over `depends_on` edges restricted to the done subset.
/// Dependents of a result that is not done were already skipped upstream,
/// so every remaining edge is satisfiable.
pub fn commit_order(results: &[OperationExecutionResult]) -> Vec<&OperationExecutionResult> {
    let done: BTreeMap<&str, &OperationExecutionResult> = results
        .iter()
        .filter(|r| r.status == TaskStatus::Done)
        .map(|r| (r.op_id.as_str(), r))
        .collect();

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, result) in &done {
        let deps: BTreeSet<&str> = result
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| done.contains_key(d) && d != id)
            .collect();
        in_degree.insert(*id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(*id);
        }
    }

    let key = |id: &str| (done[id].order, id.to_string());
    let mut ready: BTreeSet<(i32, String)> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| key(*id))
        .collect();
    let mut ordered = Vec::with_capacity(done.len());

    while let Some((_, id)) = ready.pop_first() {
        for dependent in dependents.get(id.as_str()).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(key(*dependent));
                }
            }
        }
        ordered.push(done[id.as_str()]);
    }

    if ordered.len() < done.len() {
        // Only reachable with a cycle among done results; commit the rest by key
        let placed: BTreeSet<&str> = ordered.iter().map(|r| r.op_id.as_str()).collect();
        let mut rest: Vec<&OperationExecutionResult> = done
            .values()
            .copied()
            .filter(|r| !placed.contains(r.op_id.as_str()))
            .collect();
        rest.sort_by(|a, b| (a.order, &a.op_id).cmp(&(b.order, &b.op_id)));
        ordered.extend(rest);
    }
    ordered
}

/// Collaborators the commit phase writes through
pub struct CommitContext<'a> {
    pub hook: Hook,
    pub persisted: Option<&'a PersistedArtifactStore>,
    pub session: &'a SessionKey,
    pub pipeline_id: &'a str,
    pub turns: &'a dyn TurnPersistence,
    pub user_turn: &'a TurnRef,
    pub assistant_turn: &'a TurnRef,
    pub emitter: &'a RunEmitter,
}

enum Applied {
    Applied,
    Skipped(String),
}

/// Commit every effect of one hook's results into `state`
#[instrument(skip_all, fields(hook = %ctx.hook))]
pub async fn commit_effects(
    ctx: &CommitContext<'_>,
    state: &mut RunState,
    results: &[OperationExecutionResult],
) -> CommitOutcome {
    let mut effects = Vec::new();
    let mut required_error = false;

    for result in commit_order(results) {
        for effect in &result.effects {
            let effect_type = effect.effect_type().to_string();

            let outcome = match policy::validate(ctx.hook, effect) {
                Err(violation) => Err(violation.message),
                Ok(()) => apply(ctx, state, effect).await.map_err(|e| e.to_string()),
            };

            let committed = match outcome {
                Ok(Applied::Applied) => {
                    debug!("Applied {} from {}", effect_type, effect.op_id);
                    ctx.emitter.emit(RunEvent::EffectApplied {
                        hook: ctx.hook,
                        op_id: effect.op_id.clone(),
                        effect_type: effect_type.clone(),
                    });
                    CommittedEffect {
                        op_id: effect.op_id.clone(),
                        effect_type,
                        status: EffectCommitStatus::Applied,
                        message: None,
                    }
                }
                Ok(Applied::Skipped(message)) => {
                    debug!("Skipped {} from {}: {}", effect_type, effect.op_id, message);
                    ctx.emitter.emit(RunEvent::EffectSkipped {
                        hook: ctx.hook,
                        op_id: effect.op_id.clone(),
                        effect_type: effect_type.clone(),
                        message: message.clone(),
                    });
                    CommittedEffect {
                        op_id: effect.op_id.clone(),
                        effect_type,
                        status: EffectCommitStatus::Skipped,
                        message: Some(message),
                    }
                }
                Err(message) => {
                    warn!("Commit of {} from {} failed: {}", effect_type, effect.op_id, message);
                    if result.required {
                        required_error = true;
                    }
                    ctx.emitter.emit(RunEvent::EffectError {
                        hook: ctx.hook,
                        op_id: effect.op_id.clone(),
                        effect_type: effect_type.clone(),
                        message: message.clone(),
                    });
                    CommittedEffect {
                        op_id: effect.op_id.clone(),
                        effect_type,
                        status: EffectCommitStatus::Error,
                        message: Some(message),
                    }
                }
            };
            effects.push(committed);
        }
    }

    CommitOutcome {
        report: CommitPhaseReport {
            hook: ctx.hook,
            status: if required_error {
                CommitStatus::Error
            } else {
                CommitStatus::Done
            },
            effects,
        },
        required_error,
    }
}

async fn apply(ctx: &CommitContext<'_>, state: &mut RunState, effect: &RuntimeEffect) -> Result<Applied> {
    match &effect.kind {
        EffectKind::ArtifactUpsert(upsert) => match upsert.persistence {
            Persistence::RunOnly => {
                state.run_artifacts.upsert(upsert);
                Ok(Applied::Applied)
            }
            Persistence::Persisted => apply_persisted(ctx, state, &effect.op_id, upsert).await,
        },
        EffectKind::UserReplaceText { text } => {
            ctx.turns.replace_text(ctx.user_turn, text).await?;
            state.user_text = text.clone();
            apply_to_messages(&mut state.effective_prompt_draft, &effect.kind);
            Ok(Applied::Applied)
        }
        EffectKind::AssistantReplaceText { text } => {
            ctx.turns.replace_text(ctx.assistant_turn, text).await?;
            state.assistant_text = text.clone();
            apply_to_messages(&mut state.effective_prompt_draft, &effect.kind);
            Ok(Applied::Applied)
        }
        kind => {
            apply_to_messages(&mut state.effective_prompt_draft, kind);
            Ok(Applied::Applied)
        }
    }
}

async fn apply_persisted(
    ctx: &CommitContext<'_>,
    state: &mut RunState,
    op_id: &str,
    upsert: &ArtifactUpsert,
) -> Result<Applied> {
    let store = ctx.persisted.ok_or_else(|| {
        HearthError::ArtifactBackend("no persisted artifact store is configured".to_string())
    })?;

    let latest = state.persisted_artifacts_snapshot.get(&upsert.tag);
    if latest.is_some_and(|stored| stored.value.value == upsert.value) {
        return Ok(Applied::Skipped("unchanged".to_string()));
    }
    let based_on_version = latest.map(|stored| stored.version).unwrap_or(0);

    let writer = WriterId::new(ctx.pipeline_id, op_id);
    let stored = store
        .upsert(ctx.session, upsert, based_on_version, &writer)
        .await?;
    state
        .persisted_artifacts_snapshot
        .insert(stored.tag.clone(), stored);
    Ok(Applied::Applied)
}
