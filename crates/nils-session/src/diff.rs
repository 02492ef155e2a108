// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Accumulated change record for one file in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    /// Unified diff text.
    pub diff: String,
}

/// Per-session diff accumulator, fed by file-watcher events between turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDiff {
    pub files: Vec<FileDiff>,
    pub additions: u64,
    pub deletions: u64,
}

impl SessionDiff {
    /// Insert or replace the record for `diff.path` and refresh the
    /// counters.
    pub fn upsert(&mut self, diff: FileDiff) {
        match self.files.iter_mut().find(|f| f.path == diff.path) {
            Some(existing) => *existing = diff,
            None => self.files.push(diff),
        }
        self.additions = self.files.iter().map(|f| f.additions).sum();
        self.deletions = self.files.iter().map(|f| f.deletions).sum();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
