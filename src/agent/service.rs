//! The agent service: classifies inbound messages, dispatches slash
//! commands, and drives the full pipeline for normal conversation.
//!
//! Pipeline phases persist to the task store and journal as they run so
//! a crash at any point is recoverable. History reads and writes are
//! bracketed by the conversation mutex; LLM calls, tool calls, and
//! verification run with the mutex released.

use crate::agent::tool_loop::{TaskContext, ToolLoop};
use crate::agent::verify::{CompositeVerifier, Rating, Verifier as _, VerifyContext, should_verify};
use crate::channel::ChannelManager;
use crate::config::{Config, VerificationConfig};
use crate::error::{ChannelError, Result};
use crate::llm::{ChatMessage, ChatRole, LlmService};
use crate::mcp::ToolSource;
use crate::skills::{
    SkillDefinition, SkillInvocation, SkillOutcome, SkillRegistry, builtins, substitute_arguments,
};
use crate::storage::{HistoryAppend, HistoryEntry, HistoryStore, Journal, JournalEvent};
use crate::tasks::{ConversationMutex, PhaseUpdate, TaskManager, TaskPhase};
use crate::{MessageHandler, NormalizedMessage, OutgoingMessage};

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tokio::sync::Mutex;

static SLASH_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([A-Za-z0-9_-]+)(?:\s+([\s\S]+))?$").expect("slash regex")
});

/// Everything the service needs from the composition root.
pub struct AgentDeps {
    pub llm: Arc<LlmService>,
    pub verifier_llm: Arc<LlmService>,
    pub history: Arc<HistoryStore>,
    pub journal: Arc<Journal>,
    pub tasks: Arc<TaskManager>,
    pub mutex: Arc<ConversationMutex>,
    pub channels: Arc<ChannelManager>,
    pub tools: Arc<dyn ToolSource>,
    pub skills: Arc<SkillRegistry>,
}

/// Behavioural knobs lifted out of the config file.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub persona_prompt: String,
    pub verification: VerificationConfig,
    pub channel_verification: HashMap<String, VerificationConfig>,
    pub history_limit: usize,
    pub max_tool_iterations: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            persona_prompt: config.persona.system_prompt.clone(),
            verification: config.verification.clone(),
            channel_verification: config
                .channels
                .iter()
                .filter_map(|(id, channel)| {
                    channel
                        .verification
                        .clone()
                        .map(|verification| (id.clone(), verification))
                })
                .collect(),
            history_limit: config.history.max_messages,
            max_tool_iterations: 10,
        }
    }
}

pub struct AgentService {
    deps: AgentDeps,
    settings: AgentSettings,
    /// `(channelId:conversationId)` to the most recent response, backing
    /// the `/retry` builtin.
    last_responses: Mutex<HashMap<String, String>>,
    started: Instant,
}

impl AgentService {
    pub fn new(deps: AgentDeps, settings: AgentSettings) -> Arc<Self> {
        Arc::new(Self {
            deps,
            settings,
            last_responses: Mutex::new(HashMap::new()),
            started: Instant::now(),
        })
    }

    /// The process-wide handler the channel manager installs on every
    /// channel.
    pub fn handler(self: Arc<Self>) -> MessageHandler {
        let service = self;
        Arc::new(move |message| {
            let service = service.clone();
            Box::pin(async move {
                service.handle_message(message).await;
            })
        })
    }

    fn verification_for(&self, channel_id: &str) -> &VerificationConfig {
        self.settings
            .channel_verification
            .get(channel_id)
            .unwrap_or(&self.settings.verification)
    }

    /// Entry point for every inbound message.
    pub async fn handle_message(self: Arc<Self>, message: NormalizedMessage) {
        if message.text.trim().is_empty() {
            tracing::debug!(channel = %message.channel_id, "dropping message without text");
            return;
        }

        if let Some((name, args)) = parse_slash_command(&message.text)
            && let Some(skill) = self.deps.skills.get(&name).await
            && skill.user_invocable
        {
            self.dispatch_skill(skill, args, message).await;
            return;
        }

        let service = self.clone();
        self.deps
            .tasks
            .clone()
            .submit(message, move |task_id, message| async move {
                service.run_pipeline(&task_id, message).await
            })
            .await;
    }

    /// Slash-command dispatch: builtins run in-process and reply
    /// synchronously; content-based skills become a background task
    /// with a single scoped completion.
    async fn dispatch_skill(
        self: Arc<Self>,
        skill: SkillDefinition,
        args: String,
        message: NormalizedMessage,
    ) {
        if skill.instructions.is_some() {
            let service = self.clone();
            let skill_name = skill.name.clone();
            self.deps
                .tasks
                .clone()
                .submit(message, move |task_id, message| async move {
                    service
                        .run_content_skill(&task_id, &skill_name, &args, message)
                        .await
                })
                .await;
            return;
        }

        self.deps
            .journal
            .record(
                JournalEvent::SkillDispatched,
                &message.id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"skill": skill.name, "kind": "builtin"}),
            )
            .await;

        let Some(executor) = self.deps.skills.executor(&skill.name).await else {
            tracing::warn!(skill = %skill.name, "builtin skill has no executor installed");
            return;
        };

        let invocation = SkillInvocation {
            message: message.clone(),
            args,
        };
        match executor(invocation).await {
            Ok(outcome) if outcome.handled => {
                self.send_reply(&message, outcome.text).await;
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(skill = %skill.name, %error, "builtin skill failed");
                self.send_reply(
                    &message,
                    format!("⚠ An error occurred processing your message: {error}"),
                )
                .await;
            }
        }
    }

    /// Content-based slash skill: one completion with the skill's
    /// instructions as system prompt, the raw message as user prompt.
    async fn run_content_skill(
        &self,
        task_id: &str,
        skill_name: &str,
        args: &str,
        message: NormalizedMessage,
    ) -> Result<()> {
        let Some(skill) = self.deps.skills.get(skill_name).await else {
            return Err(anyhow::anyhow!("skill {skill_name} disappeared").into());
        };
        let instructions = skill
            .instructions
            .ok_or_else(|| anyhow::anyhow!("skill {skill_name} has no instructions"))?;

        self.deps
            .journal
            .record(
                JournalEvent::SkillDispatched,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"skill": skill_name, "kind": "content"}),
            )
            .await;

        let system = substitute_arguments(&instructions, args);

        self.journal_task(task_id, &message, JournalEvent::LlmCallStarted).await;
        let response = self.deps.llm.complete(&system, &message.text).await?;
        self.journal_task(task_id, &message, JournalEvent::LlmCallCompleted).await;

        let channel = self
            .deps
            .channels
            .get(&message.channel_id)
            .await
            .ok_or_else(|| ChannelError::NotFound {
                id: message.channel_id.clone(),
            })?;
        channel
            .send_message(
                &message.conversation_id,
                OutgoingMessage::reply_to(response, message.platform_message_id.clone()),
            )
            .await?;
        self.journal_task(task_id, &message, JournalEvent::ResponseSent).await;
        Ok(())
    }

    /// The full pipeline (§ phases a-h of the task record's lifecycle).
    pub async fn run_pipeline(&self, task_id: &str, message: NormalizedMessage) -> Result<()> {
        let key = message.conversation_key();
        self.journal_task(task_id, &message, JournalEvent::PipelineStarted).await;

        // a: commit the user message.
        {
            let _guard = self.deps.mutex.acquire(&key).await;
            self.deps.history.append(
                &message.channel_id,
                &message.conversation_id,
                HistoryAppend {
                    role: ChatRole::User,
                    content: message.text.clone(),
                    tool_call_id: None,
                    sender_id: Some(message.sender_id.clone()),
                    platform_message_id: message.platform_message_id.clone(),
                    task_id: Some(task_id.to_string()),
                },
            )?;
        }
        self.deps
            .journal
            .record(
                JournalEvent::HistoryAppended,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"role": "user"}),
            )
            .await;
        self.deps
            .tasks
            .update_phase(task_id, TaskPhase::HistoryWritten, PhaseUpdate::default());

        // b: snapshot the conversation.
        let snapshot = {
            let _guard = self.deps.mutex.acquire(&key).await;
            self.deps.history.get_messages(
                &message.channel_id,
                &message.conversation_id,
                self.settings.history_limit,
            )?
        };

        // c: build the transcript and tool catalogue.
        let mut messages = vec![ChatMessage::system(&self.settings.persona_prompt)];
        messages.extend(snapshot.iter().map(entry_to_chat));
        let base_messages = messages.clone();
        let base_len = messages.len();

        let mut tools = self.deps.tools.get_all_tools().await;
        tools.extend(self.deps.skills.model_tools().await);

        self.journal_task(task_id, &message, JournalEvent::LlmCallStarted).await;
        self.deps
            .tasks
            .update_phase(task_id, TaskPhase::LlmCalling, PhaseUpdate::default());

        // d: the tool-use loop.
        let context = TaskContext {
            task_id,
            channel_id: &message.channel_id,
            conversation_id: &message.conversation_id,
        };
        let tool_loop = ToolLoop {
            llm: &self.deps.llm,
            tools: self.deps.tools.as_ref(),
            skills: &self.deps.skills,
            journal: &self.deps.journal,
            max_iterations: self.settings.max_tool_iterations,
        };
        let mut response = tool_loop.run(context, &mut messages, &tools).await?;

        // e: verification.
        let verification = self.verification_for(&message.channel_id);
        if should_verify(&message.text, &response, verification) {
            self.deps.tasks.update_phase(
                task_id,
                TaskPhase::Verifying,
                PhaseUpdate {
                    pending_response: Some(response.clone()),
                    ..PhaseUpdate::default()
                },
            );
            self.journal_task(task_id, &message, JournalEvent::VerificationStarted).await;
            response = self
                .run_verification(context, verification, &message.text, &base_messages, response)
                .await?;
        }

        // f: persist the tool exchange and the final response.
        let exchange: Vec<ChatMessage> = messages.drain(base_len..).collect();
        {
            let _guard = self.deps.mutex.acquire(&key).await;
            for turn in &exchange {
                self.deps.history.append(
                    &message.channel_id,
                    &message.conversation_id,
                    HistoryAppend {
                        role: turn.role,
                        content: turn.content.clone(),
                        tool_call_id: turn.tool_call_id.clone(),
                        sender_id: None,
                        platform_message_id: None,
                        task_id: Some(task_id.to_string()),
                    },
                )?;
            }
            self.deps.history.append(
                &message.channel_id,
                &message.conversation_id,
                HistoryAppend {
                    role: ChatRole::Assistant,
                    content: response.clone(),
                    tool_call_id: None,
                    sender_id: None,
                    platform_message_id: None,
                    task_id: Some(task_id.to_string()),
                },
            )?;
        }
        self.deps
            .journal
            .record(
                JournalEvent::HistoryAppended,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"role": "assistant"}),
            )
            .await;
        self.deps.tasks.update_phase(
            task_id,
            TaskPhase::Responding,
            PhaseUpdate {
                pending_response: Some(response.clone()),
                ..PhaseUpdate::default()
            },
        );

        // g: remember the response for /retry.
        self.last_responses
            .lock()
            .await
            .insert(key.clone(), response.clone());

        // h: deliver.
        let channel = self
            .deps
            .channels
            .get(&message.channel_id)
            .await
            .ok_or_else(|| ChannelError::NotFound {
                id: message.channel_id.clone(),
            })?;
        channel
            .send_message(
                &message.conversation_id,
                OutgoingMessage::reply_to(response, message.platform_message_id.clone()),
            )
            .await?;
        self.journal_task(task_id, &message, JournalEvent::ResponseSent).await;

        Ok(())
    }

    /// Bounded critique-and-revision. At most `max_retries` verifier
    /// invocations and `max_retries` regenerations; after exhaustion
    /// the last response is delivered as-is.
    async fn run_verification(
        &self,
        context: TaskContext<'_>,
        config: &VerificationConfig,
        user_text: &str,
        base_messages: &[ChatMessage],
        initial: String,
    ) -> Result<String> {
        let composite = CompositeVerifier::from_config(config, self.deps.verifier_llm.clone());
        let mut current = initial;
        let mut feedback: Vec<String> = Vec::new();

        for attempt in 1..=config.max_retries {
            let verdict = composite
                .verify(
                    user_text,
                    &current,
                    &VerifyContext {
                        history: base_messages,
                        attempt,
                    },
                )
                .await;

            self.deps
                .journal
                .record(
                    JournalEvent::VerificationResult,
                    context.task_id,
                    context.channel_id,
                    context.conversation_id,
                    serde_json::json!({
                        "attempt": attempt,
                        "passed": verdict.passed,
                        "rating": verdict.rating.as_str(),
                        "confidence": verdict.confidence,
                    }),
                )
                .await;

            if verdict.passed {
                return Ok(current);
            }
            if let Some(note) = verdict.feedback.clone() {
                feedback.push(note);
            }
            let feedback_list = bulleted(&feedback);

            let regenerated = match verdict.rating {
                Rating::Redo => {
                    // Regenerate from scratch with the accumulated
                    // feedback folded into the system prompt.
                    let mut rebuilt = base_messages.to_vec();
                    if let Some(system) = rebuilt.first_mut() {
                        system.content = format!(
                            "{}\n\nYour previous attempts were rejected:\n{feedback_list}",
                            self.settings.persona_prompt
                        );
                    }
                    self.deps.llm.chat(&rebuilt, &[]).await?
                }
                _ => {
                    // Keep the transcript, state the required fixes.
                    let mut extended = base_messages.to_vec();
                    extended.push(ChatMessage::assistant(current.clone()));
                    extended.push(ChatMessage::user(format!(
                        "Your previous response needs fixes:\n{feedback_list}\nProvide a corrected response."
                    )));
                    self.deps.llm.chat(&extended, &[]).await?
                }
            };
            self.deps
                .journal
                .record(
                    JournalEvent::LlmCallCompleted,
                    context.task_id,
                    context.channel_id,
                    context.conversation_id,
                    serde_json::json!({"model": regenerated.model, "regeneration": attempt}),
                )
                .await;

            current = regenerated.content;
            self.deps.tasks.update_phase(
                context.task_id,
                TaskPhase::Verifying,
                PhaseUpdate {
                    pending_response: Some(current.clone()),
                    ..PhaseUpdate::default()
                },
            );
        }

        Ok(current)
    }

    async fn journal_task(
        &self,
        task_id: &str,
        message: &NormalizedMessage,
        event: JournalEvent,
    ) {
        self.deps
            .journal
            .record(
                event,
                task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::Value::Null,
            )
            .await;
    }

    async fn send_reply(&self, message: &NormalizedMessage, text: String) {
        let Some(channel) = self.deps.channels.get(&message.channel_id).await else {
            tracing::warn!(channel = %message.channel_id, "cannot reply: channel not registered");
            return;
        };
        if let Err(error) = channel
            .send_message(
                &message.conversation_id,
                OutgoingMessage::reply_to(text, message.platform_message_id.clone()),
            )
            .await
        {
            tracing::warn!(channel = %message.channel_id, %error, "failed to send reply");
        }
    }

    /// Register the builtin skills and wire their executors. Builtins
    /// are declared without executors (the registry has no access to
    /// these dependencies); this installs them after construction.
    pub async fn install_builtin_executors(self: Arc<Self>) {
        for definition in builtins::builtin_definitions() {
            self.deps.skills.register(definition).await;
        }

        let service = self.clone();
        self.deps
            .skills
            .set_executor(
                builtins::HELP,
                Arc::new(move |_invocation| {
                    let service = service.clone();
                    Box::pin(async move {
                        let skills = service.deps.skills.user_invocable().await;
                        let mut lines = vec!["Available commands:".to_string()];
                        for skill in skills {
                            let hint = skill
                                .argument_hint
                                .map(|hint| format!(" {hint}"))
                                .unwrap_or_default();
                            lines.push(format!("/{}{hint} - {}", skill.name, skill.description));
                        }
                        Ok(SkillOutcome {
                            text: lines.join("\n"),
                            handled: true,
                        })
                    })
                }),
            )
            .await;

        let service = self.clone();
        self.deps
            .skills
            .set_executor(
                builtins::CLEAR,
                Arc::new(move |invocation| {
                    let service = service.clone();
                    Box::pin(async move {
                        let message = &invocation.message;
                        let key = message.conversation_key();
                        {
                            let _guard = service.deps.mutex.acquire(&key).await;
                            service
                                .deps
                                .history
                                .clear(&message.channel_id, &message.conversation_id)?;
                        }
                        service.last_responses.lock().await.remove(&key);
                        Ok(SkillOutcome {
                            text: "Conversation history cleared.".to_string(),
                            handled: true,
                        })
                    })
                }),
            )
            .await;

        let service = self.clone();
        self.deps
            .skills
            .set_executor(
                builtins::RETRY,
                Arc::new(move |invocation| {
                    let service = service.clone();
                    Box::pin(async move {
                        let key = invocation.message.conversation_key();
                        let last = service.last_responses.lock().await.get(&key).cloned();
                        Ok(SkillOutcome {
                            text: last
                                .unwrap_or_else(|| "No previous response to retry.".to_string()),
                            handled: true,
                        })
                    })
                }),
            )
            .await;

        let service = self.clone();
        self.deps
            .skills
            .set_executor(
                builtins::STATUS,
                Arc::new(move |_invocation| {
                    let service = service.clone();
                    Box::pin(async move {
                        let statuses = service.deps.channels.statuses().await;
                        let channels = statuses
                            .iter()
                            .map(|info| format!("{}: {}", info.id, info.status))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let active = service.deps.tasks.active_count().await;
                        let uptime = service.started.elapsed().as_secs();
                        Ok(SkillOutcome {
                            text: format!(
                                "Uptime {}. Channels: {channels}. Active tasks: {active}.",
                                format_uptime(uptime)
                            ),
                            handled: true,
                        })
                    })
                }),
            )
            .await;
    }
}

fn entry_to_chat(entry: &HistoryEntry) -> ChatMessage {
    ChatMessage {
        role: entry.role,
        content: entry.content.clone(),
        tool_call_id: entry.tool_call_id.clone(),
        tool_calls: Vec::new(),
    }
}

fn bulleted(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_uptime(seconds: u64) -> String {
    if seconds >= 3600 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

/// Match `/<name>` with optional argument text.
pub fn parse_slash_command(text: &str) -> Option<(String, String)> {
    let captures = SLASH_COMMAND.captures(text.trim())?;
    let name = captures.get(1)?.as_str().to_string();
    let args = captures
        .get(2)
        .map(|args| args.as_str().trim().to_string())
        .unwrap_or_default();
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use crate::llm::{ChatModel, ChatResponse, ToolCall, ToolDefinition};
    use crate::mcp::ToolSource;
    use crate::storage::HistoryStore;
    use crate::tasks::TaskStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedChat {
        script: Vec<ChatResponse>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> crate::Result<ChatResponse> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .get(index.min(self.script.len().saturating_sub(1)))
                .cloned()
                .expect("script is never empty"))
        }
    }

    struct StubTools;

    #[async_trait]
    impl ToolSource for StubTools {
        async fn get_all_tools(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn invoke_tool(
            &self,
            _namespaced_name: &str,
            _arguments: serde_json::Value,
        ) -> crate::Result<String> {
            Ok("5".to_string())
        }
    }

    struct Harness {
        service: Arc<AgentService>,
        channel: Arc<RecordingChannel>,
        history: Arc<HistoryStore>,
        journal: Arc<Journal>,
        _dir: tempfile::TempDir,
    }

    async fn harness(script: Vec<ChatResponse>, verification: VerificationConfig) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = Arc::new(HistoryStore::new(dir.path().join("history"), 1 << 19, 20));
        let journal = Arc::new(Journal::new(dir.path().join("journal"), true, 1 << 20, 10));
        let store = Arc::new(TaskStore::new(dir.path().join("tasks")));
        let channels = Arc::new(ChannelManager::new());
        let channel = Arc::new(RecordingChannel::new("web"));
        channels.register(channel.clone()).await;
        let tasks = Arc::new(TaskManager::new(
            store,
            journal.clone(),
            channels.clone(),
            true,
        ));
        let llm = Arc::new(LlmService::with_chat_model(Arc::new(ScriptedChat {
            script,
            calls: AtomicUsize::new(0),
        })));

        let service = AgentService::new(
            AgentDeps {
                llm: llm.clone(),
                verifier_llm: llm,
                history: history.clone(),
                journal: journal.clone(),
                tasks,
                mutex: Arc::new(ConversationMutex::new()),
                channels: channels.clone(),
                tools: Arc::new(StubTools),
                skills: Arc::new(SkillRegistry::new()),
            },
            AgentSettings {
                persona_prompt: "You are helpful.".into(),
                verification,
                channel_verification: HashMap::new(),
                history_limit: 100,
                max_tool_iterations: 10,
            },
        );
        service.clone().install_builtin_executors().await;
        channels.set_handler(service.clone().handler()).await;

        Harness {
            service,
            channel,
            history,
            journal,
            _dir: dir,
        }
    }

    fn inbound(text: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: "web".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: None,
            text: text.into(),
            timestamp: 1,
            platform_message_id: Some("p9".into()),
            attachments: Vec::new(),
        }
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            model: "stub".into(),
            usage: None,
            tool_calls: Vec::new(),
        }
    }

    async fn wait_for_send(channel: &RecordingChannel, count: usize) {
        for _ in 0..100 {
            if channel.sent().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} outbound messages");
    }

    #[tokio::test]
    async fn simple_echo_end_to_end() {
        let harness = harness(
            vec![text_response("hello back")],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("hi")).await;
        wait_for_send(&harness.channel, 1).await;

        let sent = harness.channel.sent().await;
        assert_eq!(sent[0].0, "c1");
        assert_eq!(sent[0].1.text, "hello back");
        assert_eq!(sent[0].1.reply_to_message_id.as_deref(), Some("p9"));

        let messages = harness.history.get_messages("web", "c1", 10).expect("history");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[1].content, "hello back");

        // Journal carries the pipeline spine in order.
        let entries = harness.journal.read_recent(Some("web"), Some("c1"), 50).await;
        let kinds: Vec<JournalEvent> = entries.iter().rev().map(|entry| entry.event).collect();
        let spine = [
            JournalEvent::PipelineStarted,
            JournalEvent::LlmCallStarted,
            JournalEvent::LlmCallCompleted,
            JournalEvent::ResponseSent,
            JournalEvent::TaskCompleted,
        ];
        let mut cursor = 0;
        for kind in &kinds {
            if cursor < spine.len() && *kind == spine[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, spine.len(), "journal spine out of order: {kinds:?}");
    }

    #[tokio::test]
    async fn clear_command_is_synchronous_and_skips_the_pipeline() {
        let harness = harness(
            vec![text_response("reply")],
            VerificationConfig::default(),
        )
        .await;

        // Seed five history entries.
        for n in 0..5 {
            harness
                .history
                .append(
                    "web",
                    "c1",
                    HistoryAppend::new(ChatRole::User, format!("m{n}")),
                )
                .expect("seed");
        }

        harness.service.clone().handle_message(inbound("/clear")).await;
        wait_for_send(&harness.channel, 1).await;

        let sent = harness.channel.sent().await;
        assert_eq!(sent[0].1.text, "Conversation history cleared.");
        assert!(harness.history.get_messages("web", "c1", 10).expect("read").is_empty());

        let entries = harness.journal.read_recent(Some("web"), Some("c1"), 50).await;
        assert!(
            entries
                .iter()
                .all(|entry| entry.event != JournalEvent::PipelineStarted),
            "no pipeline task for a builtin"
        );
        assert!(
            entries
                .iter()
                .any(|entry| entry.event == JournalEvent::SkillDispatched)
        );
    }

    #[tokio::test]
    async fn unknown_slash_command_falls_through_to_the_pipeline() {
        let harness = harness(
            vec![text_response("normal reply")],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("/nosuchskill run")).await;
        wait_for_send(&harness.channel, 1).await;

        assert_eq!(harness.channel.sent().await[0].1.text, "normal reply");
    }

    #[tokio::test]
    async fn verification_redo_regenerates_and_delivers() {
        let verification = VerificationConfig {
            enabled: true,
            skip_for_short_responses: false,
            ..VerificationConfig::default()
        };
        let harness = harness(
            vec![
                text_response(""),
                text_response("Here is the actual answer."),
            ],
            verification,
        )
        .await;

        harness.service.clone().handle_message(inbound("give me an answer")).await;
        wait_for_send(&harness.channel, 1).await;

        assert_eq!(
            harness.channel.sent().await[0].1.text,
            "Here is the actual answer."
        );

        let entries = harness.journal.read_recent(Some("web"), Some("c1"), 50).await;
        let completions = entries
            .iter()
            .filter(|entry| entry.event == JournalEvent::LlmCallCompleted)
            .count();
        assert_eq!(completions, 2);

        let redo_results: Vec<_> = entries
            .iter()
            .filter(|entry| {
                entry.event == JournalEvent::VerificationResult && entry.data["rating"] == "REDO"
            })
            .collect();
        assert_eq!(redo_results.len(), 1);

        // The rejected empty draft never reaches history.
        let messages = harness.history.get_messages("web", "c1", 10).expect("history");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Here is the actual answer.");
    }

    #[tokio::test]
    async fn verification_exhaustion_delivers_the_last_response() {
        // The model never produces anything; the rule verifier rejects
        // every attempt. The loop must stop at max_retries and deliver
        // the final draft anyway.
        let verification = VerificationConfig {
            enabled: true,
            skip_for_short_responses: false,
            max_retries: 2,
            ..VerificationConfig::default()
        };
        let harness = harness(vec![text_response("")], verification).await;

        harness
            .service
            .clone()
            .handle_message(inbound("say something"))
            .await;
        wait_for_send(&harness.channel, 1).await;

        assert_eq!(harness.channel.sent().await[0].1.text, "");

        let entries = harness.journal.read_recent(Some("web"), Some("c1"), 50).await;
        let verifications = entries
            .iter()
            .filter(|entry| entry.event == JournalEvent::VerificationResult)
            .count();
        assert_eq!(verifications, 2, "one verifier invocation per retry");
        let completions = entries
            .iter()
            .filter(|entry| entry.event == JournalEvent::LlmCallCompleted)
            .count();
        assert_eq!(completions, 3, "tool loop exit plus one regeneration per retry");
    }

    #[tokio::test]
    async fn tool_use_round_trip_lands_in_history() {
        let mut arguments = serde_json::Map::new();
        arguments.insert("a".into(), 2.into());
        arguments.insert("b".into(), 3.into());
        let harness = harness(
            vec![
                ChatResponse {
                    content: String::new(),
                    model: "stub".into(),
                    usage: None,
                    tool_calls: vec![ToolCall {
                        id: "t1".into(),
                        name: "calc__add".into(),
                        arguments,
                    }],
                },
                text_response("The answer is 5."),
            ],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("what is 2+3?")).await;
        wait_for_send(&harness.channel, 1).await;

        assert_eq!(harness.channel.sent().await[0].1.text, "The answer is 5.");

        let messages = harness.history.get_messages("web", "c1", 10).expect("history");
        let roles: Vec<ChatRole> = messages.iter().map(|entry| entry.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::Assistant
            ]
        );
        assert_eq!(messages[1].content, "");
        assert_eq!(messages[2].content, "5");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(messages[3].content, "The answer is 5.");
    }

    #[tokio::test]
    async fn retry_resends_the_last_response() {
        let harness = harness(
            vec![text_response("first answer")],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("question")).await;
        wait_for_send(&harness.channel, 1).await;

        harness.service.clone().handle_message(inbound("/retry")).await;
        wait_for_send(&harness.channel, 2).await;
        assert_eq!(harness.channel.sent().await[1].1.text, "first answer");
    }

    #[tokio::test]
    async fn retry_without_history_explains_itself() {
        let harness = harness(
            vec![text_response("unused")],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("/retry")).await;
        wait_for_send(&harness.channel, 1).await;
        assert_eq!(
            harness.channel.sent().await[0].1.text,
            "No previous response to retry."
        );
    }

    #[tokio::test]
    async fn help_lists_builtins() {
        let harness = harness(
            vec![text_response("unused")],
            VerificationConfig::default(),
        )
        .await;

        harness.service.clone().handle_message(inbound("/help")).await;
        wait_for_send(&harness.channel, 1).await;
        let text = harness.channel.sent().await[0].1.text.clone();
        assert!(text.starts_with("Available commands:"));
        assert!(text.contains("/clear"));
        assert!(text.contains("/retry"));
    }

    #[test]
    fn slash_parsing_boundaries() {
        assert_eq!(
            parse_slash_command("/clear"),
            Some(("clear".into(), String::new()))
        );
        assert_eq!(
            parse_slash_command("/summarize the last meeting"),
            Some(("summarize".into(), "the last meeting".into()))
        );
        assert_eq!(parse_slash_command("not a command"), None);
        assert_eq!(parse_slash_command("/"), None);
        assert_eq!(parse_slash_command("hi /clear"), None);
    }
}
