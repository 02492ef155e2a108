// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::Ruleset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Set while a summarising compaction is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<DateTime<Utc>>,
}

/// Anchor for reverting a session to an earlier point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertAnchor {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Opaque handle to an external publishing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub id: String,
    pub secret: String,
    pub url: String,
}

/// Running file-change counters; the per-file diffs live in their own
/// store table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
}

/// An ordered conversation.  Messages are totally ordered by their sortable
/// ids; at most one message is in flight (no `time.completed`) at any
/// moment, enforced by the per-session lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    /// Parent session for subagent/branch sessions; must belong to the
    /// same project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub directory: PathBuf,
    pub version: String,
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    /// Session-level permission ruleset; overrides agent and project rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Ruleset>,
    #[serde(default)]
    pub summary: SessionSummary,
}

impl Session {
    pub fn new(project_id: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: nils_id::ascending(nils_id::Kind::Session),
            project_id: project_id.into(),
            parent_id: None,
            title: String::new(),
            directory: directory.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
                archived: None,
            },
            revert: None,
            share: None,
            permissions: None,
            summary: SessionSummary::default(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn touch(&mut self) {
        self.time.updated = Utc::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_get_sortable_ids() {
        let a = Session::new("prj", "/w");
        let b = Session::new("prj", "/w");
        assert!(a.id.starts_with("ses_"));
        assert!(a.id < b.id);
    }

    #[test]
    fn with_parent_links_session() {
        let parent = Session::new("prj", "/w");
        let child = Session::new("prj", "/w").with_parent(&parent.id);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn json_omits_unset_optionals() {
        let s = Session::new("prj", "/w");
        let v = serde_json::to_value(&s).unwrap();
        assert!(v.get("parent_id").is_none());
        assert!(v.get("share").is_none());
        assert!(v.get("revert").is_none());
    }

    #[test]
    fn roundtrips_with_share_and_revert() {
        let mut s = Session::new("prj", "/w");
        s.share = Some(ShareInfo {
            id: "sh1".into(),
            secret: "sec".into(),
            url: "https://example.com/s/sh1".into(),
        });
        s.revert = Some(RevertAnchor {
            message_id: "msg_1".into(),
            part_id: None,
            snapshot: None,
            diff: None,
        });
        let text = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }
}
