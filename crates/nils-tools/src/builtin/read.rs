// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCtx, ToolError, ToolOutput};

/// Read a file from the worktree.  Records the read time so editing tools
/// can verify freshness.
pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file. Returns the file content as text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "Path to the file, relative to the worktree" },
                "offset": { "type": "integer", "description": "1-based first line to return" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["filePath"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let file_path = args["filePath"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidParams("filePath is required".into()))?;
        let path = ctx.resolve_path(file_path);
        let key = path.to_string_lossy().to_string();
        ctx.ask(
            &key,
            vec![format!("read:{key}"), "read:*".to_string()],
            json!({ "filePath": file_path }),
        )
        .await?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {e}", path.display())))?;

        let output = match (args["offset"].as_u64(), args["limit"].as_u64()) {
            (None, None) => content.clone(),
            (offset, limit) => {
                let start = offset.unwrap_or(1).saturating_sub(1) as usize;
                let take = limit.unwrap_or(u64::MAX) as usize;
                content
                    .lines()
                    .skip(start)
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        ctx.files.record_read(&path);
        let lines = output.lines().count();
        Ok(ToolOutput {
            title: file_path.to_string(),
            output,
            metadata: json!({ "lines": lines }),
            attachments: vec![],
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
