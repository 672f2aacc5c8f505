//! Skills: named units of behaviour invokable by slash command or by
//! LLM tool selection.

pub mod builtins;
pub mod loader;
pub mod registry;

pub use registry::{
    SKILL_TOOL_PREFIX, SkillContextMode, SkillDefinition, SkillExecutor, SkillInvocation,
    SkillOutcome, SkillRegistry, SkillSource, substitute_arguments,
};
