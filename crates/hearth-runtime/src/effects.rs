//! Typed effects and their pure appliers
//!
//! Every operation renders to exactly one effect. Appliers here only touch
//! the values they are handed; committing to run state happens elsewhere.

use hearth_artifacts::ArtifactUpsert;
use hearth_core::{Persistence, PromptMessage, Role};
use serde::{Deserialize, Serialize};

use crate::operations::{OperationOutput, PromptTimeOutput, SystemUpdateMode, TurnTarget};

/// What an effect asks to change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EffectKind {
    #[serde(rename = "prompt.system_update")]
    SystemUpdate {
        mode: SystemUpdateMode,
        payload: String,
    },
    #[serde(rename = "prompt.append_after_last_user")]
    AppendAfterLastUser { role: Role, payload: String },
    #[serde(rename = "prompt.insert_at_depth")]
    InsertAtDepth {
        role: Role,
        depth_from_end: usize,
        payload: String,
    },
    #[serde(rename = "artifact.upsert")]
    ArtifactUpsert(ArtifactUpsert),
    #[serde(rename = "turn.user.replace_text")]
    UserReplaceText { text: String },
    #[serde(rename = "turn.assistant.replace_text")]
    AssistantReplaceText { text: String },
}

impl EffectKind {
    /// Stable dotted name used in policy, reports and events
    pub fn effect_type(&self) -> &'static str {
        match self {
            Self::SystemUpdate { .. } => "prompt.system_update",
            Self::AppendAfterLastUser { .. } => "prompt.append_after_last_user",
            Self::InsertAtDepth { .. } => "prompt.insert_at_depth",
            Self::ArtifactUpsert(_) => "artifact.upsert",
            Self::UserReplaceText { .. } => "turn.user.replace_text",
            Self::AssistantReplaceText { .. } => "turn.assistant.replace_text",
        }
    }

    pub fn is_prompt(&self) -> bool {
        matches!(
            self,
            Self::SystemUpdate { .. } | Self::AppendAfterLastUser { .. } | Self::InsertAtDepth { .. }
        )
    }
}

/// An effect tagged with the operation that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEffect {
    pub op_id: String,
    #[serde(flatten)]
    pub kind: EffectKind,
}

impl RuntimeEffect {
    pub fn new(op_id: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            op_id: op_id.into(),
            kind,
        }
    }

    pub fn effect_type(&self) -> &'static str {
        self.kind.effect_type()
    }

    /// Map rendered template text to the effect an output declares
    pub fn from_output(op_id: &str, output: &OperationOutput, rendered: String) -> Self {
        let kind = match output {
            OperationOutput::Artifacts {
                tag,
                persistence,
                usage,
                semantics,
            } => EffectKind::ArtifactUpsert(ArtifactUpsert {
                tag: tag.clone(),
                persistence: *persistence,
                usage: usage.clone(),
                semantics: semantics.clone(),
                value: rendered,
            }),
            OperationOutput::TurnCanonicalization { target } => match target {
                TurnTarget::User => EffectKind::UserReplaceText { text: rendered },
                TurnTarget::Assistant => EffectKind::AssistantReplaceText { text: rendered },
            },
            OperationOutput::PromptTime(prompt) => match prompt {
                PromptTimeOutput::SystemUpdate { mode } => EffectKind::SystemUpdate {
                    mode: *mode,
                    payload: rendered,
                },
                PromptTimeOutput::AppendAfterLastUser { role } => EffectKind::AppendAfterLastUser {
                    role: *role,
                    payload: rendered,
                },
                PromptTimeOutput::InsertAtDepth {
                    role,
                    depth_from_end,
                } => EffectKind::InsertAtDepth {
                    role: *role,
                    depth_from_end: *depth_from_end,
                    payload: rendered,
                },
            },
        };
        Self::new(op_id, kind)
    }

    /// Persistence of an artifact effect, if this is one
    pub fn persistence(&self) -> Option<Persistence> {
        match &self.kind {
            EffectKind::ArtifactUpsert(upsert) => Some(upsert.persistence),
            _ => None,
        }
    }
}

/// Apply a `prompt.*` or `turn.*` effect to a message list
///
/// Returns false for artifact effects, which do not touch messages.
pub fn apply_to_messages(messages: &mut Vec<PromptMessage>, kind: &EffectKind) -> bool {
    match kind {
        EffectKind::SystemUpdate { mode, payload } => {
            system_update(messages, *mode, payload);
            true
        }
        EffectKind::AppendAfterLastUser { role, payload } => {
            append_after_last_user(messages, *role, payload);
            true
        }
        EffectKind::InsertAtDepth {
            role,
            depth_from_end,
            payload,
        } => {
            insert_at_depth(messages, *role, *depth_from_end, payload);
            true
        }
        EffectKind::UserReplaceText { text } => {
            replace_last_of_role(messages, Role::User, text);
            true
        }
        EffectKind::AssistantReplaceText { text } => {
            replace_last_of_role(messages, Role::Assistant, text);
            true
        }
        EffectKind::ArtifactUpsert(_) => false,
    }
}

/// Edit the first system message, inserting one at the top when absent
pub fn system_update(messages: &mut Vec<PromptMessage>, mode: SystemUpdateMode, payload: &str) {
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            system.content = match mode {
                SystemUpdateMode::Prepend => format!("{}\n{}", payload, system.content),
                SystemUpdateMode::Append => format!("{}\n{}", system.content, payload),
                SystemUpdateMode::Replace => payload.to_string(),
            };
        }
        None => messages.insert(0, PromptMessage::system(payload)),
    }
}

/// Insert right after the last user message, or at the end without one
pub fn append_after_last_user(messages: &mut Vec<PromptMessage>, role: Role, payload: &str) {
    let index = messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .map(|i| i + 1)
        .unwrap_or(messages.len());
    messages.insert(index, PromptMessage::new(role, payload));
}

/// Insert `depth_from_end` messages before the end; depth 0 appends
pub fn insert_at_depth(messages: &mut Vec<PromptMessage>, role: Role, depth_from_end: usize, payload: &str) {
    let index = messages.len() - depth_from_end.min(messages.len());
    messages.insert(index, PromptMessage::new(role, payload));
}

/// Rewrite the last message of a role; no-op when there is none
pub fn replace_last_of_role(messages: &mut [PromptMessage], role: Role, text: &str) {
    if let Some(message) = messages.iter_mut().rev().find(|m| m.role == role) {
        message.content = text.to_string();
    }
}
