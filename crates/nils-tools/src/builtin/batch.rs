// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCtx, ToolError, ToolOutput};

const MIN_CALLS: usize = 1;
const MAX_CALLS: usize = 10;
/// Tools that must not run inside a batch: `batch` itself (no recursion),
/// plus tools whose read-then-act contract breaks under concurrency.
const DISALLOWED: &[&str] = &["batch", "edit", "todoread"];

/// Execute several tool calls concurrently.  Each sub-call goes through
/// the full dispatch pipeline, so it gets its own tool part and its own
/// permission ask.
pub struct BatchTool;

#[async_trait]
impl Tool for BatchTool {
    fn name(&self) -> &str {
        "batch"
    }

    fn description(&self) -> &str {
        "Run multiple independent tool calls concurrently."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_calls": {
                    "type": "array",
                    "minItems": MIN_CALLS,
                    "maxItems": MAX_CALLS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": { "type": "string" },
                            "parameters": { "type": "object" }
                        },
                        "required": ["tool", "parameters"]
                    }
                }
            },
            "required": ["tool_calls"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let calls = args["tool_calls"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidParams("tool_calls is required".into()))?;
        if calls.len() < MIN_CALLS || calls.len() > MAX_CALLS {
            return Err(ToolError::InvalidParams(format!(
                "tool_calls must contain between {MIN_CALLS} and {MAX_CALLS} entries, got {}",
                calls.len()
            )));
        }
        let dispatcher = ctx
            .dispatcher
            .clone()
            .ok_or_else(|| ToolError::Failed("batch cannot run nested".into()))?;

        let futures = calls.iter().map(|call| {
            let dispatcher = dispatcher.clone();
            let tool = call["tool"].as_str().unwrap_or_default().to_string();
            let params = call["parameters"].clone();
            let ctx = ctx.clone();
            async move {
                if tool.is_empty() {
                    return (tool, Err(ToolError::InvalidParams("tool is required".into())));
                }
                if DISALLOWED.contains(&tool.as_str()) {
                    return (
                        tool.clone(),
                        Err(ToolError::Blocked(format!(
                            "{tool} is not allowed inside a batch"
                        ))),
                    );
                }
                let result = dispatcher.dispatch(&tool, params, &ctx).await;
                (tool, result)
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut ok = 0usize;
        let mut lines = Vec::with_capacity(results.len());
        for (tool, result) in &results {
            match result {
                Ok(_) => {
                    ok += 1;
                    lines.push(format!("{tool}: ok"));
                }
                Err(e) => lines.push(format!("{tool}: error: {e}")),
            }
        }
        let summary = format!("{ok}/{} successful", results.len());
        lines.push(summary.clone());

        Ok(ToolOutput {
            title: summary,
            output: lines.join("\n"),
            metadata: json!({ "total": results.len(), "succeeded": ok }),
            attachments: vec![],
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
