// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Deterministic providers for tests: no network, exact event sequences.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::provider::{EventStream, ModelProvider};
use crate::types::{
    CompletionRequest, ModelInfo, ProviderError, Role, StreamEvent, StreamUsage,
};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "mock-model"
    }
    fn info(&self) -> ModelInfo {
        ModelInfo::default()
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        let events = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::TextEnd),
            Ok(StreamEvent::StepFinish {
                usage: StreamUsage {
                    input: 10,
                    output: 10,
                    ..StreamUsage::default()
                },
                cost: 0.0,
            }),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// A pre-scripted provider.  Each `complete` call pops the next script
/// from the front of the queue, so tests can specify exact multi-round
/// event sequences, including tool calls, without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<Result<StreamEvent, ProviderError>>>>,
    info: ModelInfo,
    /// Pause inserted before every event; lets cancellation tests abort
    /// mid-stream.
    delay: Duration,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|s| s.into_iter().map(Ok).collect())
                    .collect(),
            ),
            info: ModelInfo::default(),
            delay: Duration::ZERO,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Script a single call that streams `reply` and standard usage.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_script(reply)])
    }

    /// Round 1 emits one tool call; round 2 streams `final_text`.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCall {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::StepFinish {
                    usage: StreamUsage {
                        input: 5,
                        output: 5,
                        ..StreamUsage::default()
                    },
                    cost: 0.0,
                },
                StreamEvent::Done,
            ],
            text_script(final_text),
        ])
    }

    pub fn with_info(mut self, info: ModelInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append a script for one more `complete` call.
    pub fn push_script(&self, script: Vec<StreamEvent>) {
        self.scripts
            .lock()
            .unwrap()
            .push(script.into_iter().map(Ok).collect());
    }
}

/// Standard text reply script: delta, end, usage, done.
pub fn text_script(reply: impl Into<String>) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(reply.into()),
        StreamEvent::TextEnd,
        StreamEvent::StepFinish {
            usage: StreamUsage {
                input: 5,
                output: 5,
                ..StreamUsage::default()
            },
            cost: 0.0,
        },
        StreamEvent::Done,
    ]
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "scripted-mock"
    }
    fn info(&self) -> ModelInfo {
        self.info
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Scripts exhausted: behave like a finished model.
                vec![Ok(StreamEvent::Done)]
            } else {
                scripts.remove(0)
            }
        };
        let delay = self.delay;
        let stream = futures::stream::iter(script).then(move |ev| async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            ev
        });
        Ok(Box::pin(stream))
    }
}

/// Fails with a transient error `failures` times, then succeeds with a
/// text reply.  Counts attempts for retry tests.
pub struct FlakyProvider {
    failures: u32,
    reply: String,
    attempts: AtomicU32,
}

impl FlakyProvider {
    pub fn new(failures: u32, reply: impl Into<String>) -> Self {
        Self {
            failures,
            reply: reply.into(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "flaky-mock"
    }
    fn info(&self) -> ModelInfo {
        ModelInfo::default()
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<EventStream, ProviderError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ProviderError::Api {
                status: 503,
                message: "overloaded".into(),
            });
        }
        Ok(Box::pin(futures::stream::iter(
            text_script(self.reply.clone()).into_iter().map(Ok),
        )))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
