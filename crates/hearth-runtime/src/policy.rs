//! Static table of which effect types are legal at which hook

use hearth_core::Hook;
use serde::Serialize;

use crate::effects::{EffectKind, RuntimeEffect};

/// Rejection from the effect policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Whether `effect` may be committed at `hook`
///
/// Before the main LLM call the assistant turn does not exist yet. After it,
/// the prompt has already been sent.
pub fn validate(hook: Hook, effect: &RuntimeEffect) -> Result<(), PolicyViolation> {
    let allowed = match hook {
        Hook::BeforeMainLlm => !matches!(effect.kind, EffectKind::AssistantReplaceText { .. }),
        Hook::AfterMainLlm => !effect.kind.is_prompt(),
    };

    if allowed {
        Ok(())
    } else {
        Err(PolicyViolation {
            code: "effect_forbidden".to_string(),
            message: format!(
                "{} is forbidden at {} (produced by {})",
                effect.effect_type(),
                hook,
                effect.op_id
            ),
        })
    }
}
