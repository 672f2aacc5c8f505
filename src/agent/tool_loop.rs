//! The bounded tool-use loop.
//!
//! Each iteration asks the LLM for the next step. Tool calls are
//! executed (skill tools through a scoped completion, everything else
//! through the MCP manager) and their results fed back as `tool`
//! turns. Tool errors are inlined into the result text and never abort
//! the loop. After `max_iterations` without a plain response, one final
//! call without tools settles the answer.

use crate::error::Result;
use crate::llm::{ChatMessage, LlmService, ToolCall, ToolDefinition};
use crate::mcp::ToolSource;
use crate::skills::{SKILL_TOOL_PREFIX, SkillRegistry, substitute_arguments};
use crate::storage::{Journal, JournalEvent};

/// Identity of the task driving this loop, for journaling.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    pub task_id: &'a str,
    pub channel_id: &'a str,
    pub conversation_id: &'a str,
}

pub struct ToolLoop<'a> {
    pub llm: &'a LlmService,
    pub tools: &'a dyn ToolSource,
    pub skills: &'a SkillRegistry,
    pub journal: &'a Journal,
    pub max_iterations: usize,
}

impl ToolLoop<'_> {
    /// Drive the transcript to a plain text response. Performs at most
    /// `max_iterations + 1` LLM calls and journals `llm_call_completed`
    /// once, at exit.
    pub async fn run(
        &self,
        context: TaskContext<'_>,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<String> {
        for _ in 0..self.max_iterations {
            let response = self.llm.chat(messages, tools).await?;

            if response.tool_calls.is_empty() {
                self.journal_llm_completed(context, &response.model).await;
                return Ok(response.content);
            }

            let mut assistant = ChatMessage::assistant(response.content.clone());
            assistant.tool_calls = response.tool_calls.clone();
            messages.push(assistant);

            for call in &response.tool_calls {
                self.journal
                    .record(
                        JournalEvent::ToolCallStarted,
                        context.task_id,
                        context.channel_id,
                        context.conversation_id,
                        serde_json::json!({"tool": call.name, "callId": call.id}),
                    )
                    .await;

                let result = self.execute_tool(call).await;

                self.journal
                    .record(
                        JournalEvent::ToolCallCompleted,
                        context.task_id,
                        context.channel_id,
                        context.conversation_id,
                        serde_json::json!({
                            "tool": call.name,
                            "callId": call.id,
                            "resultLength": result.chars().count(),
                        }),
                    )
                    .await;

                messages.push(ChatMessage::tool(result, call.id.clone()));
            }
        }

        // Bound reached: settle with one last call, tools withheld.
        let response = self.llm.chat(messages, &[]).await?;
        self.journal_llm_completed(context, &response.model).await;
        Ok(response.content)
    }

    async fn journal_llm_completed(&self, context: TaskContext<'_>, model: &str) {
        self.journal
            .record(
                JournalEvent::LlmCallCompleted,
                context.task_id,
                context.channel_id,
                context.conversation_id,
                serde_json::json!({"model": model}),
            )
            .await;
    }

    /// Resolve one tool call to its result text. Never fails: errors
    /// become the result.
    async fn execute_tool(&self, call: &ToolCall) -> String {
        if let Some(skill_name) = call.name.strip_prefix(SKILL_TOOL_PREFIX) {
            return self.execute_skill_tool(skill_name, call).await;
        }

        match self
            .tools
            .invoke_tool(&call.name, serde_json::Value::Object(call.arguments.clone()))
            .await
        {
            Ok(result) => result,
            Err(error) => format!("Tool error: {error}"),
        }
    }

    async fn execute_skill_tool(&self, skill_name: &str, call: &ToolCall) -> String {
        let Some(skill) = self.skills.get(skill_name).await else {
            return format!("Skill {skill_name} not found");
        };
        let Some(instructions) = skill.instructions else {
            return format!("Skill {skill_name} not found");
        };

        let args = call.arguments_text();
        let system = substitute_arguments(&instructions, &args);
        match self.llm.complete(&system, &args).await {
            Ok(text) => text,
            Err(error) => format!("Tool error: {error}"),
        }
    }
}
