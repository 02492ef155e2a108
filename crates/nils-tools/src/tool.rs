// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use nils_event::Bus;
use nils_session::Ruleset;
use nils_store::Store;

use crate::filetimes::FileTimes;
use crate::gate::{AskRequest, PermissionGate};
use crate::truncate::Direction;

/// Tool-local failures, mapped onto the error taxonomy by the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("aborted")]
    Aborted,
    #[error("{0}")]
    Failed(String),
}

/// Result of a successful tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub title: String,
    pub output: String,
    pub metadata: Value,
    pub attachments: Vec<String>,
}

impl ToolOutput {
    pub fn text(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Value::Object(Default::default()),
            attachments: Vec::new(),
        }
    }
}

/// Runs one named tool through the full pipeline (validate hook,
/// permission gate, execution, truncation) and records its own tool part.
/// Implemented by the turn engine; handed to tools that fan out to other
/// tools (`batch`).
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &str, args: Value, ctx: &ToolCtx) -> Result<String, ToolError>;
}

/// Everything a tool call may touch.  One context per call.
#[derive(Clone)]
pub struct ToolCtx {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    /// Name of the tool being executed; set by the dispatcher.
    pub tool: String,
    pub worktree: PathBuf,
    /// The enclosing turn's cancellation signal.
    pub abort: CancellationToken,
    pub bus: Arc<Bus>,
    pub store: Arc<Store>,
    pub files: Arc<FileTimes>,
    pub gate: Arc<PermissionGate>,
    /// Agent-level rules for this turn, evaluated between the session
    /// override and the project rules.
    pub agent_rules: Ruleset,
    /// Set for top-level calls; `None` inside a batch so nesting stops at
    /// one level.
    pub dispatcher: Option<Arc<dyn ToolDispatcher>>,
}

impl ToolCtx {
    /// Ask the permission gate for this call.  Returns normally on allow;
    /// raises `PermissionDenied` on deny or user rejection.
    pub async fn ask(
        &self,
        key: impl Into<String>,
        patterns: Vec<String>,
        metadata: Value,
    ) -> Result<(), ToolError> {
        self.gate
            .ask(AskRequest {
                tool: self.tool.clone(),
                key: key.into(),
                patterns,
                metadata,
                session_id: self.session_id.clone(),
                call_id: self.call_id.clone(),
                agent_rules: self.agent_rules.clone(),
                cancel: self.abort.clone(),
            })
            .await
    }

    /// Resolve a possibly-relative path against the worktree.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.worktree.join(p)
        }
    }
}

/// The shared contract every tool implements.  Individual tool semantics
/// stay out of the core: the engine only sees this trait.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    /// Which end of an oversized output survives truncation.
    fn truncation_direction(&self) -> Direction {
        Direction::Head
    }
    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_output_text_constructor() {
        let out = ToolOutput::text("read", "abc");
        assert_eq!(out.title, "read");
        assert_eq!(out.output, "abc");
        assert!(out.attachments.is_empty());
        assert!(out.metadata.is_object());
    }

    #[test]
    fn errors_format_their_payload() {
        assert_eq!(
            ToolError::InvalidParams("missing filePath".into()).to_string(),
            "invalid parameters: missing filePath"
        );
        assert_eq!(ToolError::Aborted.to_string(), "aborted");
    }
}
