// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tool::{Tool, ToolCtx, ToolError, ToolOutput};
use crate::truncate::Direction;

/// Run a shell command in the worktree.  The permission key is the command
/// itself, so rules can allow-list command prefixes (`bash:git *`).
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the worktree and return its combined output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to run" },
                "timeout": { "type": "integer", "description": "Timeout in seconds" }
            },
            "required": ["command"]
        })
    }

    /// Command output: the tail (final result) matters more than the
    /// preamble when the caps hit.
    fn truncation_direction(&self) -> Direction {
        Direction::Tail
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidParams("command is required".into()))?;

        let prefix_pattern = command
            .split_whitespace()
            .next()
            .map(|word| format!("bash:{word} *"))
            .unwrap_or_else(|| "bash:*".to_string());
        ctx.ask(
            command,
            vec![prefix_pattern, format!("bash:{command}")],
            json!({ "command": command }),
        )
        .await?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.worktree)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Failed(format!("spawn failed: {e}")))?;

        let timeout = args["timeout"]
            .as_u64()
            .map(std::time::Duration::from_secs);

        // Dropping the child on the cancel/timeout arms kills the process
        // (kill_on_drop) and closes its pipes.
        let result = tokio::select! {
            out = child.wait_with_output() => out,
            _ = ctx.abort.cancelled() => return Err(ToolError::Aborted),
            _ = sleep_opt(timeout) => {
                return Err(ToolError::Failed(format!("command timed out: {command}")));
            }
        };
        let result = result.map_err(|e| ToolError::Failed(e.to_string()))?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        Ok(ToolOutput {
            title: command.to_string(),
            output,
            metadata: json!({ "exit_code": result.status.code() }),
            attachments: vec![],
        })
    }
}

/// Sleep for `duration`, or forever when none is set.
async fn sleep_opt(duration: Option<std::time::Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
