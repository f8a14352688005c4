//! Operation configuration and graph validation
//!
//! An operation is a configured template task bound to one hook. It renders
//! to exactly one effect whose type is fixed by its declared output.

use hearth_core::{GenerationTrigger, Hook, Persistence, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Kind of work an operation performs; only templates execute here
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Template,
    Llm,
    Rag,
    Tool,
}

/// Which turn a canonicalization operation rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTarget {
    User,
    Assistant,
}

/// How a system update combines with the existing system message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemUpdateMode {
    Prepend,
    Append,
    Replace,
}

/// Prompt-time output variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptTimeOutput {
    SystemUpdate { mode: SystemUpdateMode },
    AppendAfterLastUser { role: Role },
    InsertAtDepth { role: Role, depth_from_end: usize },
}

/// Declared output of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    /// Rendered text becomes an artifact value
    Artifacts {
        tag: String,
        #[serde(default)]
        persistence: Persistence,
        #[serde(default)]
        usage: String,
        #[serde(default)]
        semantics: String,
    },
    /// Rendered text replaces a turn's text
    TurnCanonicalization { target: TurnTarget },
    /// Rendered text edits the prompt draft
    PromptTime(PromptTimeOutput),
}

/// One configured operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    pub op_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: OperationKind,
    pub hook: Hook,
    /// Empty means every trigger
    #[serde(default)]
    pub triggers: Vec<GenerationTrigger>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub template: String,
    /// Overrides the configured default when set
    #[serde(default)]
    pub strict_variables: Option<bool>,
    pub output: OperationOutput,
}

fn default_enabled() -> bool {
    true
}

impl OperationConfig {
    /// Template operation with defaults for everything but identity and output
    pub fn template(
        op_id: impl Into<String>,
        hook: Hook,
        template: impl Into<String>,
        output: OperationOutput,
    ) -> Self {
        let op_id = op_id.into();
        Self {
            name: op_id.clone(),
            op_id,
            kind: OperationKind::Template,
            hook,
            triggers: Vec::new(),
            order: 0,
            depends_on: Vec::new(),
            required: false,
            enabled: true,
            template: template.into(),
            strict_variables: None,
            output,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
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

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_strict_variables(mut self, strict: bool) -> Self {
        self.strict_variables = Some(strict);
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<GenerationTrigger>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Whether this operation applies to a hook and trigger
    pub fn applies_to(&self, hook: Hook, trigger: GenerationTrigger) -> bool {
        self.hook == hook && (self.triggers.is_empty() || self.triggers.contains(&trigger))
    }
}

/// Operations bound to `hook` that apply to `trigger`
pub fn select_operations(
    operations: &[OperationConfig],
    hook: Hook,
    trigger: GenerationTrigger,
) -> Vec<OperationConfig> {
    operations
        .iter()
        .filter(|op| op.applies_to(hook, trigger))
        .cloned()
        .collect()
}

/// Structural problem in an operation graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum GraphIssue {
    DuplicateId { op_id: String },
    UnknownDependency { op_id: String, dependency: String },
    CrossHookDependency { op_id: String, dependency: String },
    Cycle { op_ids: Vec<String> },
}

impl std::fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId { op_id } => write!(f, "duplicate operation id {}", op_id),
            Self::UnknownDependency { op_id, dependency } => {
                write!(f, "{} depends on unknown operation {}", op_id, dependency)
            }
            Self::CrossHookDependency { op_id, dependency } => {
                write!(f, "{} depends on {} which runs at another hook", op_id, dependency)
            }
            Self::Cycle { op_ids } => write!(f, "dependency cycle among {}", op_ids.join(", ")),
        }
    }
}

/// Report structural problems without rejecting the graph
///
/// The orchestrator already degrades every issue reported here to
/// `dependency_not_done` skips, so callers log these rather than fail.
pub fn validate_operation_graph(operations: &[OperationConfig]) -> Vec<GraphIssue> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    let mut hooks: BTreeMap<&str, Hook> = BTreeMap::new();

    for op in operations {
        if !seen.insert(op.op_id.as_str()) {
            issues.push(GraphIssue::DuplicateId {
                op_id: op.op_id.clone(),
            });
        }
        hooks.entry(op.op_id.as_str()).or_insert(op.hook);
    }

    for op in operations {
        for dep in &op.depends_on {
            match hooks.get(dep.as_str()) {
                None => issues.push(GraphIssue::UnknownDependency {
                    op_id: op.op_id.clone(),
                    dependency: dep.clone(),
                }),
                Some(hook) if *hook != op.hook => issues.push(GraphIssue::CrossHookDependency {
                    op_id: op.op_id.clone(),
                    dependency: dep.clone(),
                }),
                Some(_) => {}
            }
        }
    }

    // Kahn's algorithm over known edges; whatever never reaches in-degree 0 sits on a cycle
    let mut in_degree: BTreeMap<&str, usize> = hooks.keys().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for op in operations {
        let deps: BTreeSet<&str> = op
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| hooks.contains_key(d))
            .collect();
        for dep in deps {
            *in_degree.entry(op.op_id.as_str()).or_default() += 1;
            dependents.entry(dep).or_default().push(op.op_id.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(id) = ready.pop() {
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }
        in_degree.remove(id);
    }

    if !in_degree.is_empty() {
        issues.push(GraphIssue::Cycle {
            op_ids: in_degree.keys().map(|id| id.to_string()).collect(),
        });
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(tag: &str) -> OperationOutput {
        OperationOutput::Artifacts {
            tag: tag.to_string(),
            persistence: Persistence::RunOnly,
            usage: String::new(),
            semantics: String::new(),
        }
    }

    fn op(id: &str, deps: &[&str]) -> OperationConfig {
        OperationConfig::template(id, Hook::BeforeMainLlm, "x", artifact(id))
            .with_depends_on(deps.iter().copied())
    }

    #[test]
    fn test_select_filters_by_hook_and_trigger() {
        let ops = vec![
            op("a", &[]),
            OperationConfig::template("b", Hook::AfterMainLlm, "x", artifact("b")),
            op("c", &[]).with_triggers(vec![GenerationTrigger::Regenerate]),
        ];

        let selected = select_operations(&ops, Hook::BeforeMainLlm, GenerationTrigger::Generate);
        let ids: Vec<_> = selected.iter().map(|o| o.op_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        let selected = select_operations(&ops, Hook::BeforeMainLlm, GenerationTrigger::Regenerate);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_valid_graph_has_no_issues() {
        let ops = vec![op("a", &[]), op("b", &["a"]), op("c", &["a"]), op("d", &["b", "c"])];
        assert!(validate_operation_graph(&ops).is_empty());
    }

    #[test]
    fn test_reports_unknown_and_duplicate() {
        let ops = vec![op("a", &["ghost"]), op("a", &[])];
        let issues = validate_operation_graph(&ops);
        assert!(issues.contains(&GraphIssue::DuplicateId { op_id: "a".into() }));
        assert!(issues.contains(&GraphIssue::UnknownDependency {
            op_id: "a".into(),
            dependency: "ghost".into()
        }));
    }

    #[test]
    fn test_reports_cycle_and_cross_hook() {
        let ops = vec![
            op("a", &["b"]),
            op("b", &["a"]),
            op("c", &[]),
            OperationConfig::template("late", Hook::AfterMainLlm, "x", artifact("late"))
                .with_depends_on(["c"]),
        ];
        let issues = validate_operation_graph(&ops);

        assert!(issues.contains(&GraphIssue::Cycle {
            op_ids: vec!["a".into(), "b".into()]
        }));
        assert!(issues.contains(&GraphIssue::CrossHookDependency {
            op_id: "late".into(),
            dependency: "c".into()
        }));
    }

    #[test]
    fn test_deserializes_from_toml() {
        let op: OperationConfig = toml::from_str(
            r#"
            op_id = "note"
            hook = "before_main_llm"
            template = "note={{ art.world_state }}"
            depends_on = ["world"]
            required = true

            [output]
            type = "prompt_time"
            kind = "append_after_last_user"
            role = "developer"
            "#,
        )
        .unwrap();

        assert!(op.enabled);
        assert_eq!(op.kind, OperationKind::Template);
        assert_eq!(
            op.output,
            OperationOutput::PromptTime(PromptTimeOutput::AppendAfterLastUser {
                role: Role::Developer
            })
        );
    }
}
