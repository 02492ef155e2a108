// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// Tracks when each file was last read by a tool, so editing tools can
/// refuse to overwrite a file the model has not seen in its current state.
#[derive(Default)]
pub struct FileTimes {
    read_at: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl FileTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, path: impl Into<PathBuf>) {
        self.read_at
            .lock()
            .unwrap()
            .insert(path.into(), SystemTime::now());
    }

    /// Check that `path` was read, and not modified on disk since.
    /// Missing files pass (creating a new file needs no prior read).
    pub fn assert_read_fresh(&self, path: &Path) -> Result<(), String> {
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return Ok(()),
        };
        let read_at = self.read_at.lock().unwrap().get(path).copied();
        match read_at {
            None => Err(format!(
                "{} must be read before it is modified",
                path.display()
            )),
            Some(at) if mtime > at => Err(format!(
                "{} changed on disk since it was last read",
                path.display()
            )),
            Some(_) => Ok(()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
