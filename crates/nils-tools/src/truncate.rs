// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Tool output truncation with spill-to-disk.
//!
//! Outputs handed back to the model are capped; the full text is spilled
//! to `<data>/tool-output/<id>` so the UI (and the user) can always read
//! it.  Spill file names are tool-output ids, so their age is recoverable
//! from the embedded timestamp without a stat call; a best-effort GC on
//! first use removes files older than 7 days.
use std::path::{Path, PathBuf};
use std::sync::Once;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

pub const MAX_LINES: usize = 2000;
pub const MAX_BYTES: usize = 51_200;
const GC_MAX_AGE_DAYS: i64 = 7;

/// Which end of an oversized output survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Head,
    Tail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Truncated {
    pub content: String,
    pub truncated: bool,
    /// Id of the spill file when truncation happened.
    pub spill_id: Option<String>,
}

pub struct Truncator {
    spill_dir: PathBuf,
    max_lines: usize,
    max_bytes: usize,
    gc: Once,
}

impl Truncator {
    pub fn new(spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: spill_dir.into(),
            max_lines: MAX_LINES,
            max_bytes: MAX_BYTES,
            gc: Once::new(),
        }
    }

    /// Test hook: shrink the caps.
    pub fn with_limits(mut self, max_lines: usize, max_bytes: usize) -> Self {
        self.max_lines = max_lines;
        self.max_bytes = max_bytes;
        self
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Cap `output`; spill the full text when either bound is exceeded.
    pub fn process(&self, output: &str, direction: Direction) -> std::io::Result<Truncated> {
        self.gc.call_once(|| gc_spill_dir(&self.spill_dir));

        let line_count = output.lines().count();
        if line_count <= self.max_lines && output.len() <= self.max_bytes {
            return Ok(Truncated {
                content: output.to_string(),
                truncated: false,
                spill_id: None,
            });
        }

        let id = nils_id::ascending(nils_id::Kind::ToolOutput);
        std::fs::create_dir_all(&self.spill_dir)?;
        let spill_path = self.spill_dir.join(&id);
        std::fs::write(&spill_path, output)?;
        debug!(path = %spill_path.display(), bytes = output.len(), "spilled tool output");

        let preview = self.preview(output, line_count, direction);
        let dropped_lines = line_count.saturating_sub(preview.lines().count());
        let content = match direction {
            Direction::Head => format!(
                "{preview}\n... {dropped_lines} lines truncated ...\n(full output: {})",
                spill_path.display()
            ),
            Direction::Tail => format!(
                "... {dropped_lines} lines truncated ...\n{preview}\n(full output: {})",
                spill_path.display()
            ),
        };
        Ok(Truncated {
            content,
            truncated: true,
            spill_id: Some(id),
        })
    }

    /// Keep the surviving end, bounded by both caps.
    fn preview(&self, output: &str, line_count: usize, direction: Direction) -> String {
        let keep = self.max_lines.min(line_count);
        let lines: Vec<&str> = output.lines().collect();
        let slice: Vec<&str> = match direction {
            Direction::Head => lines[..keep].to_vec(),
            Direction::Tail => lines[line_count - keep..].to_vec(),
        };
        let mut text = slice.join("\n");
        if text.len() > self.max_bytes {
            match direction {
                Direction::Head => {
                    let mut cut = self.max_bytes;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                Direction::Tail => {
                    let mut start = text.len() - self.max_bytes;
                    while !text.is_char_boundary(start) {
                        start += 1;
                    }
                    text = text[start..].to_string();
                }
            }
        }
        text
    }
}

/// Remove spill files older than the TTL, judged by the id-embedded
/// timestamp.  Unknown file names are left alone.
fn gc_spill_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let cutoff = Utc::now() - Duration::days(GC_MAX_AGE_DAYS);
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(created) = nils_id::created_at(&name.to_string_lossy()) else {
            continue;
        };
        if created < cutoff {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), "spill GC failed: {e}");
            } else {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!(removed, dir = %dir.display(), "spill GC");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_output_passes_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let t = Truncator::new(dir.path());
        let out = t.process("hello\nworld", Direction::Head).unwrap();
        assert_eq!(out.content, "hello\nworld");
        assert!(!out.truncated);
        assert!(out.spill_id.is_none());
    }

    #[test]
    fn output_at_exactly_the_caps_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let t = Truncator::new(dir.path()).with_limits(3, 1024);
        let text = "a\nb\nc";
        let out = t.process(text, Direction::Head).unwrap();
        assert!(!out.truncated);
        assert_eq!(out.content, text);
    }

    #[test]
    fn long_output_spills_and_keeps_head() {
        let dir = tempfile::tempdir().unwrap();
        let t = Truncator::new(dir.path()).with_limits(5, 1 << 20);
        let full: String = (0..50)
            .map(|i| format!("line{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = t.process(&full, Direction::Head).unwrap();
        assert!(out.truncated);
        assert!(out.content.starts_with("line0"));
        assert!(out.content.contains("45 lines truncated"));
        let spill = dir.path().join(out.spill_id.unwrap());
        assert_eq!(std::fs::read_to_string(spill).unwrap(), full);
    }

    #[test]
    fn tail_direction_keeps_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let t = Truncator::new(dir.path()).with_limits(2, 1 << 20);
        let out = t.process("a\nb\nc\nd", Direction::Tail).unwrap();
        assert!(out.truncated);
        assert!(out.content.contains("c\nd"));
        assert!(out.content.starts_with("..."));
    }

    #[test]
    fn byte_cap_applies_when_line_count_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let t = Truncator::new(dir.path()).with_limits(1000, 10);
        let out = t.process("0123456789abcdef", Direction::Head).unwrap();
        assert!(out.truncated);
        assert!(out.content.starts_with("0123456789"));
    }

    #[test]
    fn gc_removes_expired_spills_only() {
        let dir = tempfile::tempdir().unwrap();
        // Forge an old id: timestamp 30 days back, zero counter/random.
        let old_ms = (Utc::now() - Duration::days(30)).timestamp_millis() as u64;
        let old_id = format!("out_{old_ms:012x}0000aaaaaaaaaaaa");
        std::fs::write(dir.path().join(&old_id), "stale").unwrap();
        let fresh_id = nils_id::ascending(nils_id::Kind::ToolOutput);
        std::fs::write(dir.path().join(&fresh_id), "fresh").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let t = Truncator::new(dir.path());
        // First use triggers the GC.
        let _ = t.process("x", Direction::Head).unwrap();

        assert!(!dir.path().join(&old_id).exists());
        assert!(dir.path().join(&fresh_id).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
