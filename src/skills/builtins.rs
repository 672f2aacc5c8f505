//! Builtin skill definitions.
//!
//! Definitions only: executors close over agent-service dependencies
//! and are installed after construction (see
//! `AgentService::install_builtin_executors`).

use crate::skills::registry::{SkillDefinition, SkillSource};

pub const HELP: &str = "help";
pub const CLEAR: &str = "clear";
pub const RETRY: &str = "retry";
pub const STATUS: &str = "status";

fn builtin(name: &str, description: &str, argument_hint: Option<&str>) -> SkillDefinition {
    SkillDefinition {
        name: name.to_string(),
        description: description.to_string(),
        user_invocable: true,
        argument_hint: argument_hint.map(str::to_string),
        disable_model_invocation: true,
        allowed_tools: None,
        context: None,
        instructions: None,
        source: SkillSource::Builtin,
    }
}

pub fn builtin_definitions() -> Vec<SkillDefinition> {
    vec![
        builtin(HELP, "List available commands", None),
        builtin(CLEAR, "Clear the conversation history", None),
        builtin(RETRY, "Resend the last response", None),
        builtin(STATUS, "Show host status", None),
    ]
}
