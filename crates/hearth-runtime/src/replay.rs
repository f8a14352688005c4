//! Per-task preview state built from ancestor effects only
//!
//! Instead of snapshot isolation, each task re-applies the effects of its
//! transitive ancestors to a clone of the base state. Siblings never see
//! each other, and the result does not depend on completion order.

use hearth_artifacts::ArtifactValue;
use hearth_core::{PromptMessage, Role};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::effects::{apply_to_messages, EffectKind, RuntimeEffect};

/// State a task renders against
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreviewState {
    pub messages: Vec<PromptMessage>,
    /// Persisted snapshot overlaid by run-only artifacts
    pub artifacts: BTreeMap<String, ArtifactValue>,
    pub user_text: String,
    pub assistant_text: String,
}

impl PreviewState {
    /// Apply one effect to the preview
    pub fn apply(&mut self, effect: &RuntimeEffect) {
        match &effect.kind {
            EffectKind::ArtifactUpsert(upsert) => {
                let next = ArtifactValue::next(self.artifacts.get(&upsert.tag), upsert);
                self.artifacts.insert(upsert.tag.clone(), next);
            }
            EffectKind::UserReplaceText { text } => {
                self.user_text = text.clone();
                apply_to_messages(&mut self.messages, &effect.kind);
            }
            EffectKind::AssistantReplaceText { text } => {
                self.assistant_text = text.clone();
                apply_to_messages(&mut self.messages, &effect.kind);
            }
            kind => {
                apply_to_messages(&mut self.messages, kind);
            }
        }
    }

    /// Text of the last message with `role`
    pub fn last_text(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
    }
}

/// Transitive ancestors of `op_id`, excluding itself
///
/// Unknown ids are ignored and cycles terminate.
pub fn resolve_ancestors(op_id: &str, depends_on: &BTreeMap<String, Vec<String>>) -> BTreeSet<String> {
    let mut ancestors = BTreeSet::new();
    let mut stack: Vec<&str> = depends_on
        .get(op_id)
        .map(|deps| deps.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(id) = stack.pop() {
        if id == op_id || !ancestors.insert(id.to_string()) {
            continue;
        }
        if let Some(deps) = depends_on.get(id) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    ancestors
}

/// Ancestor ids in the order their effects are re-applied
///
/// Parents come before children; ties break by `(order, op_id)`.
pub fn replay_order(
    ancestors: &BTreeSet<String>,
    depends_on: &BTreeMap<String, Vec<String>>,
    order: &BTreeMap<String, i32>,
) -> Vec<String> {
    let key = |id: &str| (order.get(id).copied().unwrap_or(0), id.to_string());
    let parents = |id: &str| -> BTreeSet<String> {
        depends_on
            .get(id)
            .into_iter()
            .flatten()
            .filter(|d| ancestors.contains(*d) && d.as_str() != id)
            .cloned()
            .collect()
    };

    let mut remaining: BTreeMap<String, BTreeSet<String>> =
        ancestors.iter().map(|id| (id.clone(), parents(id.as_str()))).collect();
    let mut ordered = Vec::with_capacity(ancestors.len());

    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| key(id.as_str()))
            .min()
            // A cycle among ancestors: fall back to the smallest key
            .or_else(|| remaining.keys().map(|id| key(id.as_str())).min());

        let Some((_, id)) = next else { break };
        remaining.remove(&id);
        for deps in remaining.values_mut() {
            deps.remove(&id);
        }
        ordered.push(id);
    }
    ordered
}

/// Preview state for a task: base plus its ancestors' recorded effects
///
/// Ancestors without a recorded effect contribute nothing.
pub fn replay(
    base: &PreviewState,
    ancestor_ids: &[String],
    effects_by_op: &BTreeMap<String, RuntimeEffect>,
) -> PreviewState {
    let mut preview = base.clone();
    for id in ancestor_ids {
        if let Some(effect) = effects_by_op.get(id) {
            preview.apply(effect);
        }
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_artifacts::ArtifactUpsert;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    fn upsert(op: &str, tag: &str, value: &str) -> RuntimeEffect {
        RuntimeEffect::new(op, EffectKind::ArtifactUpsert(ArtifactUpsert::run_only(tag, value)))
    }

    #[test]
    fn test_resolve_ancestors_is_transitive() {
        let deps = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let ancestors = resolve_ancestors("d", &deps);
        assert_eq!(
            ancestors.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(resolve_ancestors("a", &deps).is_empty());
    }

    #[test]
    fn test_resolve_ancestors_survives_cycles() {
        let deps = graph(&[("a", &["b"]), ("b", &["a"])]);
        let ancestors = resolve_ancestors("a", &deps);
        assert_eq!(ancestors.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
    }

    #[test]
    fn test_replay_order_parents_first() {
        let deps = graph(&[("root", &[]), ("z_mid", &["root"]), ("a_leaf", &["z_mid"])]);
        let ancestors = resolve_ancestors("a_leaf", &deps);
        let mut all = ancestors.clone();
        all.insert("a_leaf".to_string());

        let order = replay_order(&all, &deps, &BTreeMap::new());
        assert_eq!(order, vec!["root", "z_mid", "a_leaf"]);
    }

    #[test]
    fn test_replay_only_applies_ancestors() {
        let base = PreviewState::default();
        let mut effects = BTreeMap::new();
        effects.insert("a".to_string(), upsert("a", "world", "W"));
        effects.insert("sibling".to_string(), upsert("sibling", "secret", "S"));

        let preview = replay(&base, &["a".to_string()], &effects);
        assert_eq!(preview.artifacts["world"].value, "W");
        assert!(!preview.artifacts.contains_key("secret"));
        assert!(base.artifacts.is_empty());
    }

    #[test]
    fn test_replay_turn_effect_updates_text_and_messages() {
        let base = PreviewState {
            messages: vec![PromptMessage::user("raw")],
            user_text: "raw".into(),
            ..PreviewState::default()
        };
        let mut effects = BTreeMap::new();
        effects.insert(
            "canon".to_string(),
            RuntimeEffect::new("canon", EffectKind::UserReplaceText { text: "clean".into() }),
        );

        let preview = replay(&base, &["canon".to_string()], &effects);
        assert_eq!(preview.user_text, "clean");
        assert_eq!(preview.last_text(Role::User), Some("clean"));
    }
}
