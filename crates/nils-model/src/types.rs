// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Wire-level message content.  Deliberately minimal: the engine flattens
/// its rich part model into this shape right before each provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatContent {
    Text(String),
    ToolCall {
        call_id: String,
        name: String,
        /// JSON-encoded arguments, forwarded verbatim.
        arguments: String,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: ChatContent::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: ChatContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            ChatContent::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Tool schema advertised to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Output cap for this call; `None` uses the driver default.
    pub max_output_tokens: Option<u32>,
}

/// Token accounting for one model step, as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// One streamed event from a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    /// The current text block is complete.
    TextEnd,
    ReasoningDelta(String),
    ReasoningEnd,
    /// A complete tool call (argument deltas already assembled by the
    /// driver).
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// End of one model step, with usage and computed cost.
    StepFinish { usage: StreamUsage, cost: f64 },
    /// The stream finished normally.
    Done,
}

/// Model metadata the engine needs for budgeting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub context_window: u64,
    pub max_output_tokens: u64,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            max_output_tokens: 4_096,
        }
    }
}

/// Provider-layer failures.  `is_transient` decides what the retry loop
/// may attempt again.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("output length exceeded: {0}")]
    OutputLength(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network: {0}")]
    Network(String),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited(_) | ProviderError::Network(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
