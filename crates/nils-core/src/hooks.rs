// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Lifecycle extension points.
//!
//! All hooks run through one dispatcher that logs failures and never
//! rethrows, with a single exception: a validate hook may block the tool
//! call, and that outcome is first-class.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use nils_session::{ErrorKind, NamedError};

#[derive(Debug, Clone)]
pub struct ValidateInput {
    pub tool: String,
    pub session_id: String,
    pub call_id: String,
    pub args: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ValidateOutput {
    /// Possibly rewritten arguments.
    pub args: Value,
    pub blocked: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformInput {
    pub tool: String,
    pub session_id: String,
    pub call_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub title: String,
    pub output: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Stop,
    Compact,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// One extension point provider.  Default implementations are no-ops, so
/// hooks override only what they care about.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Pre-tool.  May rewrite `out.args` or set `out.blocked` (+ reason).
    async fn tool_execute_validate(
        &self,
        _input: &ValidateInput,
        _out: &mut ValidateOutput,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Post-tool.  May rewrite title/output/metadata.
    async fn tool_result_transform(
        &self,
        _input: &TransformInput,
        _out: &mut TransformOutput,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn session_stop(&self, _session_id: &str, _reason: StopReason) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notification_send(
        &self,
        _session_id: &str,
        _kind: &str,
    ) -> anyhow::Result<Option<Notification>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    /// Run validate hooks in registration order.  The first block wins and
    /// surfaces as `ToolBlocked`; hook panics/errors are logged and
    /// skipped.
    pub async fn validate(&self, input: &ValidateInput) -> Result<Value, NamedError> {
        let mut out = ValidateOutput {
            args: input.args.clone(),
            ..ValidateOutput::default()
        };
        for hook in &self.hooks {
            if let Err(e) = hook.tool_execute_validate(input, &mut out).await {
                warn!(tool = %input.tool, "validate hook failed: {e}");
                continue;
            }
            if out.blocked {
                let reason = out
                    .reason
                    .clone()
                    .unwrap_or_else(|| "blocked by hook".to_string());
                return Err(NamedError::new(ErrorKind::ToolBlocked, reason));
            }
        }
        Ok(out.args)
    }

    /// Run transform hooks; failures leave the output untouched.
    pub async fn transform(
        &self,
        input: &TransformInput,
        mut out: TransformOutput,
    ) -> TransformOutput {
        for hook in &self.hooks {
            if let Err(e) = hook.tool_result_transform(input, &mut out).await {
                warn!(tool = %input.tool, "transform hook failed: {e}");
            }
        }
        out
    }

    /// Fire-and-forget.
    pub fn session_stop(&self, session_id: &str, reason: StopReason) {
        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = hook.session_stop(&session_id, reason).await {
                    warn!(session = %session_id, "session.stop hook failed: {e}");
                }
            });
        }
    }

    /// Async; errors swallowed.  The first hook returning a notification
    /// wins.
    pub async fn notification(&self, session_id: &str, kind: &str) -> Option<Notification> {
        for hook in &self.hooks {
            match hook.notification_send(session_id, kind).await {
                Ok(Some(n)) => return Some(n),
                Ok(None) => {}
                Err(e) => warn!(session = %session_id, "notification hook failed: {e}"),
            }
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RewriteHook;

    #[async_trait]
    impl LifecycleHook for RewriteHook {
        async fn tool_execute_validate(
            &self,
            _input: &ValidateInput,
            out: &mut ValidateOutput,
        ) -> anyhow::Result<()> {
            out.args["rewritten"] = json!(true);
            Ok(())
        }
    }

    struct BlockingHook;

    #[async_trait]
    impl LifecycleHook for BlockingHook {
        async fn tool_execute_validate(
            &self,
            input: &ValidateInput,
            out: &mut ValidateOutput,
        ) -> anyhow::Result<()> {
            if input.tool == "bash" {
                out.blocked = true;
                out.reason = Some("no shell today".into());
            }
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl LifecycleHook for FailingHook {
        async fn tool_execute_validate(
            &self,
            _input: &ValidateInput,
            _out: &mut ValidateOutput,
        ) -> anyhow::Result<()> {
            anyhow::bail!("hook exploded")
        }

        async fn tool_result_transform(
            &self,
            _input: &TransformInput,
            _out: &mut TransformOutput,
        ) -> anyhow::Result<()> {
            anyhow::bail!("transform exploded")
        }
    }

    fn input(tool: &str) -> ValidateInput {
        ValidateInput {
            tool: tool.into(),
            session_id: "ses_1".into(),
            call_id: "call_1".into(),
            args: json!({}),
        }
    }

    #[tokio::test]
    async fn validate_can_rewrite_args() {
        let mut reg = HookRegistry::new();
        reg.register(Arc::new(RewriteHook));
        let args = reg.validate(&input("read")).await.unwrap();
        assert_eq!(args["rewritten"], true);
    }

    #[tokio::test]
    async fn validate_block_is_tool_blocked() {
        let mut reg = HookRegistry::new();
        reg.register(Arc::new(BlockingHook));
        let err = reg.validate(&input("bash")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolBlocked);
        assert_eq!(err.message, "no shell today");
        // Other tools pass.
        assert!(reg.validate(&input("read")).await.is_ok());
    }

    #[tokio::test]
    async fn failing_hooks_are_skipped_not_propagated() {
        let mut reg = HookRegistry::new();
        reg.register(Arc::new(FailingHook));
        reg.register(Arc::new(RewriteHook));
        let args = reg.validate(&input("read")).await.unwrap();
        assert_eq!(args["rewritten"], true);

        let out = reg
            .transform(
                &TransformInput {
                    tool: "read".into(),
                    session_id: "ses_1".into(),
                    call_id: "call_1".into(),
                },
                TransformOutput {
                    title: "t".into(),
                    output: "o".into(),
                    metadata: json!({}),
                },
            )
            .await;
        assert_eq!(out.title, "t");
        assert_eq!(out.output, "o");
    }

    #[tokio::test]
    async fn empty_registry_validate_returns_args() {
        let reg = HookRegistry::new();
        let args = reg.validate(&input("read")).await.unwrap();
        assert_eq!(args, json!({}));
        assert!(reg.notification("ses_1", "done").await.is_none());
    }
}
