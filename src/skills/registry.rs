//! Skill definitions and the registry.
//!
//! Builtin skills are registered at startup without executors; the
//! agent service installs those after construction (it owns the
//! dependencies the builtins close over). Content-based skills carry
//! their instructions inline and need no executor.

use crate::NormalizedMessage;
use crate::error::Result;
use crate::llm::ToolDefinition;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Namespace prefix for skill tools exposed to the model.
pub const SKILL_TOOL_PREFIX: &str = "skill__";

/// Placeholder substituted with the slash-command argument text.
const ARGUMENTS_PLACEHOLDER: &str = "$ARGUMENTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillSource {
    Builtin,
    Skillmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillContextMode {
    Fork,
    Inherit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub user_invocable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_hint: Option<String>,
    #[serde(default)]
    pub disable_model_invocation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SkillContextMode>,
    /// Content body; present for content-based skills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub source: SkillSource,
}

/// One slash invocation handed to a builtin executor.
#[derive(Debug, Clone)]
pub struct SkillInvocation {
    pub message: NormalizedMessage,
    pub args: String,
}

/// Result of a builtin execution.
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub text: String,
    pub handled: bool,
}

pub type SkillExecutor =
    Arc<dyn Fn(SkillInvocation) -> BoxFuture<'static, Result<SkillOutcome>> + Send + Sync>;

#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, SkillDefinition>>,
    executors: RwLock<HashMap<String, SkillExecutor>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, definition: SkillDefinition) {
        let mut skills = self.skills.write().await;
        if let Some(previous) = skills.insert(definition.name.clone(), definition) {
            tracing::debug!(skill = %previous.name, "skill definition replaced");
        }
    }

    /// Late-bind a programmatic executor onto a registered definition.
    pub async fn set_executor(&self, name: &str, executor: SkillExecutor) {
        self.executors
            .write()
            .await
            .insert(name.to_string(), executor);
    }

    pub async fn get(&self, name: &str) -> Option<SkillDefinition> {
        self.skills.read().await.get(name).cloned()
    }

    pub async fn executor(&self, name: &str) -> Option<SkillExecutor> {
        self.executors.read().await.get(name).cloned()
    }

    /// User-invocable skills, sorted by name (the `/help` listing).
    pub async fn user_invocable(&self) -> Vec<SkillDefinition> {
        let mut skills: Vec<_> = self
            .skills
            .read()
            .await
            .values()
            .filter(|skill| skill.user_invocable)
            .cloned()
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// One tool per content-based skill the model may invoke, named
    /// `skill__<name>` with a single `arguments` string input.
    pub async fn model_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .skills
            .read()
            .await
            .values()
            .filter(|skill| skill.instructions.is_some() && !skill.disable_model_invocation)
            .map(|skill| ToolDefinition {
                name: format!("{SKILL_TOOL_PREFIX}{}", skill.name),
                description: skill.description.clone(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "arguments": {
                            "type": "string",
                            "description": "Argument text passed to the skill",
                        }
                    },
                }),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// Substitute `$ARGUMENTS` in skill instructions; an empty argument
/// string substitutes to `(no arguments)`.
pub fn substitute_arguments(instructions: &str, args: &str) -> String {
    let replacement = if args.trim().is_empty() {
        "(no arguments)"
    } else {
        args
    };
    instructions.replace(ARGUMENTS_PLACEHOLDER, replacement)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_skill(name: &str) -> SkillDefinition {
        SkillDefinition {
            name: name.into(),
            description: format!("the {name} skill"),
            user_invocable: true,
            argument_hint: None,
            disable_model_invocation: false,
            allowed_tools: None,
            context: None,
            instructions: Some("Do the thing with $ARGUMENTS".into()),
            source: SkillSource::Skillmd,
        }
    }

    #[tokio::test]
    async fn model_tools_cover_content_skills_only() {
        let registry = SkillRegistry::new();
        registry.register(content_skill("summarize")).await;
        registry
            .register(SkillDefinition {
                name: "clear".into(),
                description: "clear history".into(),
                user_invocable: true,
                argument_hint: None,
                disable_model_invocation: true,
                allowed_tools: None,
                context: None,
                instructions: None,
                source: SkillSource::Builtin,
            })
            .await;
        let mut hidden = content_skill("secret");
        hidden.disable_model_invocation = true;
        registry.register(hidden).await;

        let tools = registry.model_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "skill__summarize");
        assert_eq!(
            tools[0].input_schema["properties"]["arguments"]["type"],
            "string"
        );
    }

    #[tokio::test]
    async fn user_invocable_is_sorted() {
        let registry = SkillRegistry::new();
        registry.register(content_skill("zeta")).await;
        registry.register(content_skill("alpha")).await;

        let listed = registry.user_invocable().await;
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[1].name, "zeta");
    }

    #[test]
    fn substitutes_arguments_or_placeholder() {
        assert_eq!(
            substitute_arguments("Summarize: $ARGUMENTS", "the report"),
            "Summarize: the report"
        );
        assert_eq!(
            substitute_arguments("Summarize: $ARGUMENTS", "   "),
            "Summarize: (no arguments)"
        );
    }
}
