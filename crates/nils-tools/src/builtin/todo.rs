// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use nils_event::Event;
use nils_session::TodoItem;

use crate::tool::{Tool, ToolCtx, ToolError, ToolOutput};

/// Replace the session's todo list wholesale.
pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todowrite"
    }

    fn description(&self) -> &str {
        "Replace the session todo list."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "content": { "type": "string" },
                            "status": { "type": "string", "enum": ["pending", "in_progress", "completed", "cancelled"] },
                            "priority": { "type": "string", "enum": ["low", "medium", "high"] }
                        },
                        "required": ["id", "content", "status", "priority"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let todos: Vec<TodoItem> = serde_json::from_value(args["todos"].clone())
            .map_err(|e| ToolError::InvalidParams(format!("todos: {e}")))?;
        ctx.ask("update", vec!["todowrite:*".to_string()], Value::Null)
            .await?;
        ctx.store
            .set_todos(&ctx.session_id, &todos)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        ctx.bus.publish(Event::TodoUpdated {
            session_id: ctx.session_id.clone(),
            todos: todos.clone(),
        });
        Ok(ToolOutput {
            title: format!("{} todos", todos.len()),
            output: serde_json::to_string_pretty(&todos).unwrap_or_default(),
            metadata: json!({ "count": todos.len() }),
            attachments: vec![],
        })
    }
}

/// Read the session's todo list.
pub struct TodoReadTool;

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todoread"
    }

    fn description(&self) -> &str {
        "Read the session todo list."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        ctx.ask("read", vec!["todoread:*".to_string()], Value::Null)
            .await?;
        let todos = ctx
            .store
            .get_todos(&ctx.session_id)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput {
            title: format!("{} todos", todos.len()),
            output: serde_json::to_string_pretty(&todos).unwrap_or_default(),
            metadata: json!({ "count": todos.len() }),
            attachments: vec![],
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
