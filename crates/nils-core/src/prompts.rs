// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::Path;

/// Base instructions shared by every agent.
const BASE_PROMPT: &str = "\
You are a coding agent operating on the user's machine. You read and edit \
files and run commands through the provided tools, always preferring tool \
calls over guesses. Keep answers short; let the work speak.";

/// Fixed instruction for summarising compaction.
pub const COMPACT_PROMPT: &str = "\
Summarise this conversation so it can replace the full history. Preserve: \
the user's goals and constraints, decisions made and why, the current state \
of every file that was touched, and the immediate next steps. Omit \
pleasantries and dead ends. Write the summary as a single message.";

/// Compose the system prompt blocks for one turn: base instructions, an
/// environment snapshot, then the agent's own prompt.  The blocks are
/// recorded verbatim on the assistant message so a resumed conversation
/// replays with exactly the same prompt.
pub fn system_blocks(worktree: &Path, agent_prompt: Option<&str>) -> Vec<String> {
    let mut blocks = vec![BASE_PROMPT.to_string(), environment_block(worktree)];
    if let Some(extra) = agent_prompt {
        if !extra.is_empty() {
            blocks.push(extra.to_string());
        }
    }
    blocks
}

fn environment_block(worktree: &Path) -> String {
    format!(
        "<environment>\nworktree: {}\nplatform: {}\ndate: {}\n</environment>",
        worktree.display(),
        std::env::consts::OS,
        chrono::Utc::now().format("%Y-%m-%d"),
    )
}

/// Derive a session title from the first prompt: the first line, bounded.
pub fn derive_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let mut title: String = line.chars().take(80).collect();
    if line.chars().count() > 80 {
        title.push('…');
    }
    title
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_start_with_base_and_environment() {
        let blocks = system_blocks(Path::new("/w"), None);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("coding agent"));
        assert!(blocks[1].contains("worktree: /w"));
    }

    #[test]
    fn agent_prompt_is_appended() {
        let blocks = system_blocks(Path::new("/w"), Some("Review code only."));
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], "Review code only.");
    }

    #[test]
    fn empty_agent_prompt_is_dropped() {
        let blocks = system_blocks(Path::new("/w"), Some(""));
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn title_is_first_line_bounded() {
        assert_eq!(derive_title("fix the bug\nmore detail"), "fix the bug");
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 81);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn title_of_empty_prompt_is_empty() {
        assert_eq!(derive_title(""), "");
    }
}
