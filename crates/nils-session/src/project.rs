// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Project id used when a directory belongs to no version-control system
/// and no stable root can be derived.
pub const GLOBAL_PROJECT_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectIcon {
    pub url: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<DateTime<Utc>>,
}

/// Logical project root.  Keyed by the root commit of its VCS so the id
/// survives worktree moves; a plain directory hashes its path instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub worktree: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<VcsKind>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<ProjectIcon>,
    pub time: ProjectTime,
    /// Directories the project's tools may touch without a path escape.
    #[serde(default)]
    pub sandboxes: Vec<PathBuf>,
}

impl Project {
    pub fn new(id: impl Into<String>, worktree: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        let worktree = worktree.into();
        let name = worktree
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Self {
            id: id.into(),
            worktree,
            vcs: None,
            name,
            icon: None,
            time: ProjectTime {
                created: now,
                updated: now,
                initialized: None,
            },
            sandboxes: Vec::new(),
        }
    }

    /// Derive the stable project id for a worktree.
    ///
    /// With a VCS the root commit id is the key: it never changes when the
    /// checkout moves.  Without one we fall back to a hash of the canonical
    /// path, which is stable as long as the directory stays put.
    pub fn derive_id(worktree: &Path, root_commit: Option<&str>) -> String {
        match root_commit {
            Some(commit) if !commit.is_empty() => commit.to_string(),
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(worktree.to_string_lossy().as_bytes());
                let digest = hasher.finalize();
                format!("prj_{}", &hex::encode(digest)[..16])
            }
        }
    }

    pub fn touch(&mut self) {
        self.time.updated = Utc::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
