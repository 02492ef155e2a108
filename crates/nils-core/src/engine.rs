// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The turn engine: drives one prompt from user input to a finalised,
//! persisted, streamed assistant message.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use nils_config::{AgentDef, Config, PermissionRuleConfig};
use nils_event::{Bus, Event};
use nils_model::{
    complete_with_retry, ChatMessage, CompletionRequest, ModelProvider, ProviderError,
    RetryPolicy, StreamEvent, StreamUsage,
};
use nils_session::{
    AssistantInfo, ErrorKind, Message, MessagePath, ModelRef, NamedError, Part, PartBody,
    PermissionAction, PermissionRule, Project, Ruleset, Session, TimeSpan, TokenUsage,
    ToolState, ToolStateTime, UserInfo,
};
use nils_store::{Store, StoreError};
use nils_tools::{
    FileTimes, PermissionGate, ToolCtx, ToolDispatcher, ToolError, ToolRegistry, Truncator,
};

use crate::compact;
use crate::hooks::{HookRegistry, StopReason, TransformInput, TransformOutput, ValidateInput};
use crate::lock::{SessionGuard, SessionLocks};
use crate::prompts;

/// One part of the user's prompt body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputPart {
    Text {
        text: String,
    },
    File {
        mime: String,
        url: String,
        filename: String,
    },
}

/// A prompt request as posted by a front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptInput {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<ModelRef>,
    pub parts: Vec<InputPart>,
}

enum TurnOutcome {
    Completed,
    /// Overflow that prune could not relieve; compaction takes over.
    Compact,
    Error(NamedError),
}

/// Process-wide engine state, wired once at startup.  No ambient identity:
/// every entry point takes explicit session/message ids.
pub struct Engine {
    config: Arc<Config>,
    store: Arc<Store>,
    bus: Arc<Bus>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    truncator: Arc<Truncator>,
    files: Arc<FileTimes>,
    locks: Arc<SessionLocks>,
    hooks: Arc<HookRegistry>,
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    project: Project,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        bus: Arc<Bus>,
        registry: ToolRegistry,
        hooks: HookRegistry,
        providers: HashMap<String, Arc<dyn ModelProvider>>,
        project: Project,
    ) -> Arc<Self> {
        let base_rules = parse_rules(&config.tools.rules);
        let gate = Arc::new(PermissionGate::new(bus.clone(), store.clone(), base_rules));
        let truncator = Arc::new(Truncator::new(
            store.data_dir().join(&config.tools.spill_dir),
        ));
        Arc::new(Self {
            config,
            store,
            bus,
            registry: Arc::new(registry),
            gate,
            truncator,
            files: Arc::new(FileTimes::new()),
            locks: SessionLocks::new(),
            hooks: Arc::new(hooks),
            providers,
            project,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn locks(&self) -> &Arc<SessionLocks> {
        &self.locks
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    // ── Session management ───────────────────────────────────────────────────

    pub fn create_session(
        &self,
        title: Option<String>,
        parent_id: Option<String>,
    ) -> Result<Session, NamedError> {
        if let Some(parent) = &parent_id {
            let parent_session = self.store.get_session(parent).map_err(store_err)?;
            if parent_session.project_id != self.project.id {
                return Err(NamedError::new(
                    ErrorKind::NotFound,
                    format!("parent session {parent} belongs to another project"),
                ));
            }
        }
        let mut session = Session::new(&self.project.id, &self.project.worktree);
        session.parent_id = parent_id;
        if let Some(title) = title {
            session.title = title;
        }
        self.store.upsert_session(&session).map_err(store_err)?;
        self.bus.publish(Event::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Cancel any running turn, then drop the session and everything it
    /// owns.
    pub fn delete_session(&self, session_id: &str) -> Result<(), NamedError> {
        self.locks.cancel(session_id);
        self.store.delete_session(session_id).map_err(store_err)?;
        self.bus.publish(Event::SessionDeleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Request cancellation of the in-flight turn.  Returns false when the
    /// session is idle.
    pub fn abort_session(&self, session_id: &str) -> bool {
        self.locks.cancel(session_id)
    }

    /// Fold a watcher-reported file change into the session diff summary.
    pub fn record_file_diff(
        &self,
        session_id: &str,
        diff: nils_session::FileDiff,
    ) -> Result<(), NamedError> {
        let mut session_diff = self.store.get_session_diff(session_id).map_err(store_err)?;
        session_diff.upsert(diff);
        self.store
            .set_session_diff(session_id, &session_diff)
            .map_err(store_err)?;
        let mut session = self.store.get_session(session_id).map_err(store_err)?;
        session.summary.additions = session_diff.additions;
        session.summary.deletions = session_diff.deletions;
        session.summary.files = session_diff.files.len() as u64;
        session.touch();
        self.store.upsert_session(&session).map_err(store_err)?;
        self.bus.publish(Event::FileWatcherUpdated {
            session_id: session_id.to_string(),
            diff: session_diff,
        });
        Ok(())
    }

    /// Drain all sessions and release resources.
    pub fn dispose(&self) {
        self.locks.cancel_all();
        if let Err(e) = self.store.flush() {
            warn!("store flush on dispose failed: {e}");
        }
    }

    // ── The turn ─────────────────────────────────────────────────────────────

    /// Run one turn.  Returns the final assistant message; errors that
    /// prevent the turn from starting (`Busy`, `NotFound`, pre-flight
    /// `OverflowError`) surface as `Err` with no state change at all.
    pub async fn prompt(
        self: &Arc<Self>,
        session_id: &str,
        input: PromptInput,
    ) -> Result<Message, NamedError> {
        let guard = self.locks.acquire(session_id)?;
        let mut session = self.store.get_session(session_id).map_err(store_err)?;

        let agent_name = input.agent.clone().unwrap_or_else(|| "build".to_string());
        let agent = self
            .config
            .agents
            .get(&agent_name)
            .cloned()
            .unwrap_or_default();
        let model_ref = input
            .model
            .clone()
            .or_else(|| agent.model.as_deref().map(parse_model_ref))
            .unwrap_or_else(|| ModelRef {
                provider_id: self.config.model.provider.clone(),
                model_id: self.config.model.name.clone(),
            });
        let provider = self.resolve_provider(&model_ref)?;

        // Pre-flight overflow check, from the last finalised assistant
        // message's accounting.
        let history = self.store.list_messages(session_id).map_err(store_err)?;
        let last_tokens = history
            .iter()
            .rev()
            .find_map(|m| m.as_assistant().map(|a| a.tokens))
            .unwrap_or_default();
        let overflowed = compact::is_overflow(&last_tokens, &provider.info());
        if overflowed && self.config.compaction.disabled {
            return Err(NamedError::new(
                ErrorKind::OverflowError,
                "context exceeds the model limit and compaction is disabled",
            ));
        }

        // Persist the user message with its parts; one transaction.
        let mut user = Message::user(
            session_id,
            UserInfo {
                agent: agent_name.clone(),
                model: model_ref.clone(),
                attachments: input
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        InputPart::File { filename, .. } => Some(filename.clone()),
                        InputPart::Text { .. } => None,
                    })
                    .collect(),
            },
        );
        user.complete();
        let user_parts: Vec<Part> = input
            .parts
            .iter()
            .map(|p| match p {
                InputPart::Text { text } => Part::text(session_id, &user.id, text),
                InputPart::File {
                    mime,
                    url,
                    filename,
                } => Part::new(
                    session_id,
                    &user.id,
                    PartBody::File {
                        mime: mime.clone(),
                        url: url.clone(),
                        filename: filename.clone(),
                        source_path: None,
                    },
                ),
            })
            .collect();
        self.store
            .persist_message_with_parts(&user, &user_parts)
            .map_err(store_err)?;
        self.bus.publish(Event::MessageUpdated {
            message: user.clone(),
        });
        for part in &user_parts {
            self.bus.publish(Event::MessagePartUpdated { part: part.clone() });
        }

        // First prompt titles the session.
        if session.title.is_empty() {
            if let Some(InputPart::Text { text }) = input
                .parts
                .iter()
                .find(|p| matches!(p, InputPart::Text { .. }))
            {
                session.title = prompts::derive_title(text);
            }
        }
        session.touch();
        self.store.upsert_session(&session).map_err(store_err)?;
        self.bus.publish(Event::SessionUpdated {
            session: session.clone(),
        });

        // Pre-flight overflow with compaction enabled: this turn becomes
        // the compaction turn; the user's question is answered next turn.
        if overflowed {
            let summary = self
                .compact_session(&session, provider.clone(), guard.cancellation())
                .await;
            self.hooks.session_stop(session_id, StopReason::Compact);
            self.bus.publish(Event::SessionIdle {
                session_id: session_id.to_string(),
            });
            return summary;
        }

        // The assistant message this turn streams into.
        let system = prompts::system_blocks(&self.project.worktree, agent.prompt.as_deref());
        let mut assistant = Message::assistant(
            session_id,
            AssistantInfo {
                parent_id: user.id.clone(),
                model_id: model_ref.model_id.clone(),
                provider_id: model_ref.provider_id.clone(),
                system,
                mode: agent_name.clone(),
                path: MessagePath {
                    cwd: session.directory.clone(),
                    root: self.project.worktree.clone(),
                },
                cost: 0.0,
                tokens: TokenUsage::default(),
                summary: false,
                error: None,
            },
        );
        self.store.upsert_message(&assistant).map_err(store_err)?;
        self.bus.publish(Event::MessageUpdated {
            message: assistant.clone(),
        });

        let outcome = self
            .stream_steps(&mut assistant, &session, provider.clone(), &agent, &guard)
            .await;

        let result = match outcome {
            TurnOutcome::Completed => {
                self.finalize(&mut assistant, None)?;
                self.hooks.session_stop(session_id, StopReason::Stop);
                let hooks = self.hooks.clone();
                let sid = session_id.to_string();
                tokio::spawn(async move {
                    let _ = hooks.notification(&sid, "turn-completed").await;
                });
                Ok(assistant)
            }
            TurnOutcome::Compact => {
                self.finalize(&mut assistant, None)?;
                let summary = self
                    .compact_session(&session, provider, guard.cancellation())
                    .await;
                self.hooks.session_stop(session_id, StopReason::Compact);
                summary
            }
            TurnOutcome::Error(err) => {
                self.abort_pending_parts(&assistant.id)?;
                let publish_banner = err.is_turn_fatal() && err.kind != ErrorKind::Aborted;
                self.finalize(&mut assistant, Some(err.clone()))?;
                if publish_banner {
                    self.bus.publish(Event::SessionError {
                        session_id: session_id.to_string(),
                        error: err,
                    });
                }
                self.hooks.session_stop(session_id, StopReason::Error);
                Ok(assistant)
            }
        };

        // UIs re-enable input on idle, whatever happened above.
        self.bus.publish(Event::SessionIdle {
            session_id: session_id.to_string(),
        });
        drop(guard);
        result
    }

    /// Set the terminal state on the assistant message and persist it.
    fn finalize(
        &self,
        assistant: &mut Message,
        error: Option<NamedError>,
    ) -> Result<(), NamedError> {
        if let Some(info) = assistant.as_assistant_mut() {
            info.error = error;
        }
        assistant.complete();
        self.store.upsert_message(assistant).map_err(store_err)?;
        self.bus.publish(Event::MessageUpdated {
            message: assistant.clone(),
        });
        Ok(())
    }

    /// Transition any still-pending tool parts to `error: Aborted`.
    fn abort_pending_parts(&self, message_id: &str) -> Result<(), NamedError> {
        for mut part in self.store.list_parts(message_id).map_err(store_err)? {
            let PartBody::Tool { ref mut state, .. } = part.body else {
                continue;
            };
            if let ToolState::Pending { input, .. } = state {
                let now = Utc::now();
                *state = ToolState::Error {
                    input: input.clone(),
                    error: NamedError::aborted(),
                    time: ToolStateTime {
                        start: now,
                        end: now,
                        compacted: None,
                    },
                };
                self.store.upsert_part(&part).map_err(store_err)?;
                self.bus.publish(Event::MessagePartUpdated { part });
            }
        }
        Ok(())
    }

    /// The stream loop: one iteration per model step, looping while the
    /// model keeps calling tools.
    async fn stream_steps(
        self: &Arc<Self>,
        assistant: &mut Message,
        session: &Session,
        provider: Arc<dyn ModelProvider>,
        agent: &AgentDef,
        guard: &SessionGuard,
    ) -> TurnOutcome {
        let cancel = guard.cancellation();
        let model_info = provider.info();
        let session_id = session.id.clone();

        loop {
            let chat = match self.build_chat(&session_id, assistant) {
                Ok(c) => c,
                Err(e) => return TurnOutcome::Error(e),
            };
            let tools = self
                .registry
                .schemas(&agent.tools)
                .into_iter()
                .map(|s| nils_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect();
            let req = CompletionRequest {
                messages: chat,
                tools,
                max_output_tokens: None,
            };

            if let Err(e) = self.push_part(
                assistant,
                PartBody::StepStart {},
            ) {
                return TurnOutcome::Error(e);
            }

            let stream = tokio::select! {
                _ = cancel.cancelled() => return TurnOutcome::Error(NamedError::aborted()),
                r = complete_with_retry(provider.as_ref(), req, RetryPolicy::default(), &cancel) => {
                    match r {
                        Ok(s) => s,
                        Err(e) => return TurnOutcome::Error(map_provider_error(e)),
                    }
                }
            };
            let mut stream = stream;

            let mut had_tools = false;
            let mut overflow = false;
            let mut current_text: Option<Part> = None;
            let mut current_reasoning: Option<Part> = None;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return TurnOutcome::Error(NamedError::aborted()),
                    ev = stream.next() => ev,
                };
                let event = match event {
                    None => break,
                    Some(Err(e)) => return TurnOutcome::Error(map_provider_error(e)),
                    Some(Ok(ev)) => ev,
                };
                match event {
                    StreamEvent::TextDelta(delta) => {
                        let part = current_text
                            .get_or_insert_with(|| Part::text(&session_id, &assistant.id, ""));
                        if let PartBody::Text { text, .. } = &mut part.body {
                            text.push_str(&delta);
                        }
                        if let Err(e) = self.save_part(part) {
                            return TurnOutcome::Error(e);
                        }
                    }
                    StreamEvent::TextEnd => {
                        current_text = None;
                    }
                    StreamEvent::ReasoningDelta(delta) => {
                        let part = current_reasoning.get_or_insert_with(|| {
                            Part::new(
                                &session_id,
                                &assistant.id,
                                PartBody::Reasoning {
                                    text: String::new(),
                                    time: TimeSpan::open(),
                                },
                            )
                        });
                        if let PartBody::Reasoning { text, .. } = &mut part.body {
                            text.push_str(&delta);
                        }
                        if let Err(e) = self.save_part(part) {
                            return TurnOutcome::Error(e);
                        }
                    }
                    StreamEvent::ReasoningEnd => {
                        if let Some(mut part) = current_reasoning.take() {
                            if let PartBody::Reasoning { time, .. } = &mut part.body {
                                time.close();
                            }
                            if let Err(e) = self.save_part(&part) {
                                return TurnOutcome::Error(e);
                            }
                        }
                    }
                    StreamEvent::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        had_tools = true;
                        // Flush any open text block before the tool part so
                        // part order mirrors the model's output order.
                        current_text = None;
                        let args: Value =
                            serde_json::from_str(&arguments).unwrap_or_else(|_| {
                                warn!(tool = %name, "unparsable tool arguments, using {{}}");
                                Value::Object(Default::default())
                            });
                        let _ = self
                            .dispatch_tool(session, &assistant.id, &id, &name, args, agent, true, &cancel)
                            .await;
                        if cancel.is_cancelled() {
                            return TurnOutcome::Error(NamedError::aborted());
                        }
                    }
                    StreamEvent::StepFinish { usage, cost } => {
                        let step = usage_to_tokens(&usage);
                        if let Some(info) = assistant.as_assistant_mut() {
                            info.tokens.accumulate(&step);
                            info.cost += cost;
                        }
                        if let Err(e) = self.push_part(
                            assistant,
                            PartBody::StepFinish { usage: step, cost },
                        ) {
                            return TurnOutcome::Error(e);
                        }
                        if let Err(e) = self
                            .store
                            .upsert_message(assistant)
                            .map_err(store_err)
                        {
                            return TurnOutcome::Error(e);
                        }
                        self.bus.publish(Event::MessageUpdated {
                            message: assistant.clone(),
                        });
                        if compact::is_overflow(&step, &model_info) {
                            overflow = true;
                        }
                    }
                    StreamEvent::Done => break,
                }
            }

            if overflow && !self.config.compaction.disabled {
                match compact::prune(&self.store, &self.bus, &session_id) {
                    Ok(0) => return TurnOutcome::Compact,
                    Ok(pruned) => debug!(session = %session_id, pruned, "pruned instead of compacting"),
                    Err(e) => return TurnOutcome::Error(store_err(e)),
                }
            }

            if !had_tools {
                return TurnOutcome::Completed;
            }
        }
    }

    /// Flatten the persisted conversation into the provider wire shape.
    fn build_chat(
        &self,
        session_id: &str,
        assistant: &Message,
    ) -> Result<Vec<ChatMessage>, NamedError> {
        let messages = self.store.list_messages(session_id).map_err(store_err)?;
        let mut parts: HashMap<String, Vec<Part>> = HashMap::new();
        for part in self
            .store
            .list_session_parts(session_id)
            .map_err(store_err)?
        {
            parts.entry(part.message_id.clone()).or_default().push(part);
        }
        let mut chat = Vec::new();
        if let Some(info) = assistant.as_assistant() {
            chat.push(ChatMessage::system(info.system.join("\n\n")));
        }
        chat.extend(compact::reconstruct(&messages, &parts));
        Ok(chat)
    }

    fn push_part(&self, message: &Message, body: PartBody) -> Result<Part, NamedError> {
        let part = Part::new(&message.session_id, &message.id, body);
        self.save_part(&part)?;
        Ok(part)
    }

    fn save_part(&self, part: &Part) -> Result<(), NamedError> {
        self.store.upsert_part(part).map_err(store_err)?;
        self.bus.publish(Event::MessagePartUpdated { part: part.clone() });
        Ok(())
    }

    // ── Tool dispatch ────────────────────────────────────────────────────────

    /// Run one tool call through the full pipeline: pending part, validate
    /// hook, permission gate, execution, truncation, transform hook,
    /// terminal part.  Returns the (possibly truncated) output text.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        self: &Arc<Self>,
        session: &Session,
        message_id: &str,
        call_id: &str,
        tool_name: &str,
        args: Value,
        agent: &AgentDef,
        allow_fanout: bool,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let mut part = Part::new(
            &session.id,
            message_id,
            PartBody::Tool {
                call_id: call_id.to_string(),
                tool: tool_name.to_string(),
                state: ToolState::Pending {
                    input: args.clone(),
                    raw: None,
                },
            },
        );
        if let Err(e) = self.save_part(&part) {
            return Err(ToolError::Failed(e.to_string()));
        }
        let started = Utc::now();

        let result = self
            .run_tool_pipeline(session, message_id, call_id, tool_name, args.clone(), agent, allow_fanout, cancel)
            .await;

        let now = Utc::now();
        let time = ToolStateTime {
            start: started,
            end: now,
            compacted: None,
        };
        match result {
            Ok((output, title, metadata, attachments)) => {
                if let PartBody::Tool { ref mut state, .. } = part.body {
                    *state = ToolState::Completed {
                        input: args,
                        output: output.clone(),
                        title,
                        metadata,
                        attachments,
                        time,
                    };
                }
                let _ = self.save_part(&part);
                Ok(output)
            }
            Err(tool_error) => {
                if let PartBody::Tool { ref mut state, .. } = part.body {
                    *state = ToolState::Error {
                        input: args,
                        error: map_tool_error(&tool_error),
                        time,
                    };
                }
                let _ = self.save_part(&part);
                Err(tool_error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool_pipeline(
        self: &Arc<Self>,
        session: &Session,
        message_id: &str,
        call_id: &str,
        tool_name: &str,
        args: Value,
        agent: &AgentDef,
        allow_fanout: bool,
        cancel: &CancellationToken,
    ) -> Result<(String, String, Value, Vec<String>), ToolError> {
        let args = self
            .hooks
            .validate(&ValidateInput {
                tool: tool_name.to_string(),
                session_id: session.id.clone(),
                call_id: call_id.to_string(),
                args,
            })
            .await
            .map_err(|e| ToolError::Blocked(e.message))?;

        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::Failed(format!("unknown tool: {tool_name}")))?;

        let ctx = ToolCtx {
            session_id: session.id.clone(),
            message_id: message_id.to_string(),
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
            worktree: session.directory.clone(),
            abort: cancel.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            files: self.files.clone(),
            gate: self.gate.clone(),
            agent_rules: parse_rules(&agent.rules),
            dispatcher: allow_fanout.then(|| {
                Arc::new(EngineDispatcher {
                    engine: self.clone(),
                    agent: agent.clone(),
                }) as Arc<dyn ToolDispatcher>
            }),
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Aborted),
            out = tool.execute(args, &ctx) => out?,
        };

        let truncated = self
            .truncator
            .process(&output.output, tool.truncation_direction())
            .map_err(|e| ToolError::Failed(format!("truncation failed: {e}")))?;
        let mut metadata = output.metadata;
        if truncated.truncated {
            metadata["truncated"] = Value::Bool(true);
            if let Some(id) = &truncated.spill_id {
                metadata["spill_id"] = Value::String(id.clone());
            }
        }

        let transformed = self
            .hooks
            .transform(
                &TransformInput {
                    tool: tool_name.to_string(),
                    session_id: session.id.clone(),
                    call_id: call_id.to_string(),
                },
                TransformOutput {
                    title: output.title,
                    output: truncated.content,
                    metadata,
                },
            )
            .await;
        Ok((
            transformed.output,
            transformed.title,
            transformed.metadata,
            output.attachments,
        ))
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Replace old history with a model-written summary message.
    async fn compact_session(
        self: &Arc<Self>,
        session: &Session,
        turn_provider: Arc<dyn ModelProvider>,
        cancel: CancellationToken,
    ) -> Result<Message, NamedError> {
        let mut session = session.clone();
        session.time.compacting = Some(Utc::now());
        session.touch();
        self.store.upsert_session(&session).map_err(store_err)?;
        self.bus.publish(Event::SessionUpdated {
            session: session.clone(),
        });

        let provider = self
            .config
            .compaction
            .summary_model
            .as_ref()
            .and_then(|key| self.providers.get(key).cloned())
            .unwrap_or(turn_provider);

        let messages = self.store.list_messages(&session.id).map_err(store_err)?;
        let mut parts: HashMap<String, Vec<Part>> = HashMap::new();
        for part in self
            .store
            .list_session_parts(&session.id)
            .map_err(store_err)?
        {
            parts.entry(part.message_id.clone()).or_default().push(part);
        }
        let parent_id = messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.id.clone())
            .unwrap_or_default();

        let mut chat = compact::reconstruct(&messages, &parts);
        chat.push(ChatMessage::user(prompts::COMPACT_PROMPT));

        let mut summary = Message::assistant(
            &session.id,
            AssistantInfo {
                parent_id,
                model_id: provider.model_id().to_string(),
                provider_id: provider.provider_id().to_string(),
                system: vec![],
                mode: "compact".to_string(),
                path: MessagePath {
                    cwd: session.directory.clone(),
                    root: self.project.worktree.clone(),
                },
                cost: 0.0,
                tokens: TokenUsage::default(),
                summary: true,
                error: None,
            },
        );
        self.store.upsert_message(&summary).map_err(store_err)?;
        self.bus.publish(Event::MessageUpdated {
            message: summary.clone(),
        });

        let result = self
            .stream_summary(&mut summary, chat, provider, &cancel)
            .await;

        session.time.compacting = None;
        session.touch();
        self.store.upsert_session(&session).map_err(store_err)?;
        self.bus.publish(Event::SessionUpdated {
            session: session.clone(),
        });

        match result {
            Ok(()) => {
                self.finalize(&mut summary, None)?;
                self.bus.publish(Event::SessionCompacted {
                    session_id: session.id.clone(),
                    message_id: summary.id.clone(),
                });
                Ok(summary)
            }
            Err(err) => {
                // Recoverable: the error lives on the summary message, the
                // session keeps working from the unchanged history.
                error!(session = %session.id, "compaction failed: {err}");
                self.abort_pending_parts(&summary.id)?;
                self.finalize(&mut summary, Some(err.clone()))?;
                if err.kind != ErrorKind::Aborted {
                    self.bus.publish(Event::SessionError {
                        session_id: session.id.clone(),
                        error: err,
                    });
                }
                Ok(summary)
            }
        }
    }

    /// Stream the (tool-free) summary completion into `summary`.
    async fn stream_summary(
        &self,
        summary: &mut Message,
        chat: Vec<ChatMessage>,
        provider: Arc<dyn ModelProvider>,
        cancel: &CancellationToken,
    ) -> Result<(), NamedError> {
        let req = CompletionRequest {
            messages: chat,
            tools: vec![],
            max_output_tokens: None,
        };
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(NamedError::aborted()),
            r = complete_with_retry(provider.as_ref(), req, RetryPolicy::default(), cancel) => {
                r.map_err(map_provider_error)?
            }
        };

        let mut text_part: Option<Part> = None;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(NamedError::aborted()),
                ev = stream.next() => ev,
            };
            match event {
                None => break,
                Some(Err(e)) => return Err(map_provider_error(e)),
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    let part = text_part
                        .get_or_insert_with(|| Part::text(&summary.session_id, &summary.id, ""));
                    if let PartBody::Text { text, .. } = &mut part.body {
                        text.push_str(&delta);
                    }
                    self.save_part(part)?;
                }
                Some(Ok(StreamEvent::StepFinish { usage, cost })) => {
                    let step = usage_to_tokens(&usage);
                    if let Some(info) = summary.as_assistant_mut() {
                        info.tokens.accumulate(&step);
                        info.cost += cost;
                    }
                }
                Some(Ok(StreamEvent::Done)) => break,
                Some(Ok(_)) => {}
            }
        }
        Ok(())
    }

    fn resolve_provider(
        &self,
        model_ref: &ModelRef,
    ) -> Result<Arc<dyn ModelProvider>, NamedError> {
        self.providers
            .get(&model_ref.provider_id)
            .cloned()
            .ok_or_else(|| NamedError::not_found("provider", &model_ref.provider_id))
    }
}

/// Batch sub-calls re-enter the pipeline here; fan-out stops at one level
/// because the sub-call context gets no dispatcher of its own.
struct EngineDispatcher {
    engine: Arc<Engine>,
    agent: AgentDef,
}

#[async_trait]
impl ToolDispatcher for EngineDispatcher {
    async fn dispatch(&self, tool: &str, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let session = self
            .engine
            .store
            .get_session(&ctx.session_id)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let call_id = nils_id::ascending(nils_id::Kind::Task);
        self.engine
            .dispatch_tool(
                &session,
                &ctx.message_id,
                &call_id,
                tool,
                args,
                &self.agent,
                false,
                &ctx.abort,
            )
            .await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn store_err(e: StoreError) -> NamedError {
    match e {
        StoreError::NotFound(kind, id) => NamedError::not_found(kind, &id),
        other => NamedError::new(ErrorKind::Unknown, other.to_string()),
    }
}

fn map_provider_error(e: ProviderError) -> NamedError {
    let kind = match &e {
        ProviderError::Auth(_) => ErrorKind::AuthError,
        ProviderError::OutputLength(_) => ErrorKind::OutputLengthError,
        _ => ErrorKind::Unknown,
    };
    NamedError::new(kind, e.to_string())
}

fn map_tool_error(e: &ToolError) -> NamedError {
    match e {
        ToolError::Blocked(reason) => NamedError::new(ErrorKind::ToolBlocked, reason.clone()),
        ToolError::PermissionDenied(reason) => {
            NamedError::new(ErrorKind::PermissionDenied, reason.clone())
        }
        ToolError::Aborted => NamedError::aborted(),
        other => NamedError::new(ErrorKind::Unknown, other.to_string()),
    }
}

fn usage_to_tokens(usage: &StreamUsage) -> TokenUsage {
    TokenUsage {
        input: usage.input,
        output: usage.output,
        reasoning: usage.reasoning,
        cache: nils_session::CacheUsage {
            read: usage.cache_read,
            write: usage.cache_write,
        },
    }
}

fn parse_rules(rules: &[PermissionRuleConfig]) -> Ruleset {
    Ruleset(
        rules
            .iter()
            .filter_map(|r| {
                let action = match r.action.as_str() {
                    "allow" => PermissionAction::Allow,
                    "deny" => PermissionAction::Deny,
                    "ask" => PermissionAction::Ask,
                    other => {
                        warn!(pattern = %r.pattern, "unknown rule action {other:?}");
                        return None;
                    }
                };
                Some(PermissionRule::new(r.pattern.clone(), action))
            })
            .collect(),
    )
}

fn parse_model_ref(spec: &str) -> ModelRef {
    match spec.split_once('/') {
        Some((provider, model)) => ModelRef {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        },
        None => ModelRef {
            provider_id: spec.to_string(),
            model_id: spec.to_string(),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
