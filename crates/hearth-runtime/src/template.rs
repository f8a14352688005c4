//! Template rendering for operations
//!
//! Templates see the task's preview state, never the committed run state.

use hearth_core::{HearthError, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{json, Map, Value};

use crate::replay::PreviewState;

/// Per-render options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Printing or iterating an undefined value is an error; testing it in
    /// `{% if %}` is still allowed
    pub strict_variables: bool,
}

/// Renders operation templates against a JSON context
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value, options: RenderOptions) -> Result<String>;
}

/// minijinja-backed renderer
pub struct MiniJinjaRenderer {
    strict: Environment<'static>,
    lenient: Environment<'static>,
}

impl MiniJinjaRenderer {
    pub fn new() -> Self {
        let mut strict = Environment::new();
        strict.set_undefined_behavior(UndefinedBehavior::SemiStrict);
        let mut lenient = Environment::new();
        lenient.set_undefined_behavior(UndefinedBehavior::Lenient);
        Self { strict, lenient }
    }
}

impl Default for MiniJinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template: &str, context: &Value, options: RenderOptions) -> Result<String> {
        let env = if options.strict_variables {
            &self.strict
        } else {
            &self.lenient
        };
        env.render_str(template, context)
            .map_err(|e| HearthError::Template(e.to_string()))
    }
}

/// Build the render context for one task
///
/// Caller variables sit at the top level; the built-in keys `art`,
/// `artifacts`, `messages`, `user_text` and `assistant_text` win on clash.
pub fn build_context(preview: &PreviewState, vars: &Map<String, Value>) -> Value {
    let mut context = vars.clone();

    let art: Map<String, Value> = preview
        .artifacts
        .iter()
        .map(|(tag, a)| (tag.clone(), Value::String(a.value.clone())))
        .collect();
    let artifacts: Map<String, Value> = preview
        .artifacts
        .iter()
        .map(|(tag, a)| {
            (
                tag.clone(),
                json!({
                    "value": a.value,
                    "history": a.history,
                    "usage": a.usage,
                    "semantics": a.semantics,
                    "persistence": a.persistence,
                }),
            )
        })
        .collect();
    let messages: Vec<Value> = preview
        .messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    context.insert("art".to_string(), Value::Object(art));
    context.insert("artifacts".to_string(), Value::Object(artifacts));
    context.insert("messages".to_string(), Value::Array(messages));
    context.insert("user_text".to_string(), Value::String(preview.user_text.clone()));
    context.insert(
        "assistant_text".to_string(),
        Value::String(preview.assistant_text.clone()),
    );
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_artifacts::{ArtifactUpsert, ArtifactValue};
    use hearth_core::PromptMessage;

    const STRICT: RenderOptions = RenderOptions {
        strict_variables: true,
    };
    const LENIENT: RenderOptions = RenderOptions {
        strict_variables: false,
    };

    fn preview() -> PreviewState {
        let mut preview = PreviewState {
            messages: vec![PromptMessage::system("sys"), PromptMessage::user("hello")],
            user_text: "hello".into(),
            ..PreviewState::default()
        };
        let first = ArtifactValue::seed(&ArtifactUpsert::run_only("mood", "calm"));
        let second = first.advanced(&ArtifactUpsert::run_only("mood", "tense"));
        preview.artifacts.insert("mood".into(), second);
        preview
    }

    #[test]
    fn test_renders_art_and_artifacts() {
        let renderer = MiniJinjaRenderer::new();
        let context = build_context(&preview(), &Map::new());

        let out = renderer
            .render(
                "{{ art.mood }} after {{ artifacts.mood.history[0] }} / {{ user_text }} / {{ messages | length }}",
                &context,
                STRICT,
            )
            .unwrap();
        assert_eq!(out, "tense after calm / hello / 2");
    }

    #[test]
    fn test_strict_rejects_undefined() {
        let renderer = MiniJinjaRenderer::new();
        let context = build_context(&preview(), &Map::new());

        let err = renderer.render("{{ nope }}", &context, STRICT).unwrap_err();
        assert_eq!(err.code(), "template_error");

        let out = renderer.render("[{{ nope }}]", &context, LENIENT).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_absent_artifact_is_falsy() {
        let renderer = MiniJinjaRenderer::new();
        let context = build_context(&PreviewState::default(), &Map::new());
        let template = "{% if art.sibling %}present{% else %}absent{% endif %}";

        for options in [STRICT, LENIENT] {
            assert_eq!(renderer.render(template, &context, options).unwrap(), "absent");
        }
        assert!(renderer.render("{{ art.sibling }}", &context, STRICT).is_err());
    }

    #[test]
    fn test_syntax_error_is_template_error() {
        let renderer = MiniJinjaRenderer::new();
        let err = renderer
            .render("{% if %}", &Value::Object(Map::new()), LENIENT)
            .unwrap_err();
        assert!(matches!(err, HearthError::Template(_)));
    }

    #[test]
    fn test_builtins_win_over_vars() {
        let mut vars = Map::new();
        vars.insert("user_text".into(), json!("shadowed"));
        vars.insert("persona".into(), json!("Ada"));

        let context = build_context(&preview(), &vars);
        assert_eq!(context["user_text"], "hello");
        assert_eq!(context["persona"], "Ada");
    }
}
