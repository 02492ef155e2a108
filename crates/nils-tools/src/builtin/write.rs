// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;

use nils_event::Event;

use crate::tool::{Tool, ToolCtx, ToolError, ToolOutput};

/// Create or overwrite a file.  Overwriting requires the file to have been
/// read first (and not modified since), so the model never clobbers state
/// it has not seen.
pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file, creating it if needed. Existing files must be read first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string", "description": "Path to the file, relative to the worktree" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["filePath", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let file_path = args["filePath"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidParams("filePath is required".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidParams("content is required".into()))?;
        let path = ctx.resolve_path(file_path);

        ctx.files
            .assert_read_fresh(&path)
            .map_err(ToolError::Blocked)?;

        let key = path.to_string_lossy().to_string();
        ctx.ask(
            &key,
            vec![format!("write:{key}"), "write:*".to_string()],
            json!({ "filePath": file_path }),
        )
        .await?;

        let old = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {e}", path.display())))?;
        ctx.files.record_read(&path);

        let diff = TextDiff::from_lines(old.as_str(), content);
        let additions = diff
            .iter_all_changes()
            .filter(|c| c.tag() == similar::ChangeTag::Insert)
            .count();
        let deletions = diff
            .iter_all_changes()
            .filter(|c| c.tag() == similar::ChangeTag::Delete)
            .count();

        ctx.bus.publish(Event::FileEdited {
            path: key.clone(),
        });

        Ok(ToolOutput {
            title: file_path.to_string(),
            output: format!("wrote {} bytes to {file_path}", content.len()),
            metadata: json!({ "additions": additions, "deletions": deletions }),
            attachments: vec![],
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
