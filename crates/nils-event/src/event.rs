// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nils_session::{Message, NamedError, Part, Session, SessionDiff, TodoItem};

/// A pending permission request, surfaced to the user for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionAsk {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    /// Patterns the user may persist with an `always` reply.
    pub patterns: Vec<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionReply {
    pub id: String,
    pub response: PermissionResponse,
}

/// Every event kind the core publishes.  Serializes as
/// `{"type": "<name>", "properties": {...}}`, which is also the SSE wire
/// format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "server.connected")]
    ServerConnected {},
    #[serde(rename = "project.updated")]
    ProjectUpdated { project: nils_session::Project },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },
    #[serde(rename = "session.deleted")]
    SessionDeleted {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(rename = "sessionID")]
        session_id: String,
        error: NamedError,
    },
    #[serde(rename = "session.idle")]
    SessionIdle {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    #[serde(rename = "session.compacted")]
    SessionCompacted {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },
    #[serde(rename = "message.part.updated")]
    MessagePartUpdated { part: Part },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },
    #[serde(rename = "todo.updated")]
    TodoUpdated {
        #[serde(rename = "sessionID")]
        session_id: String,
        todos: Vec<TodoItem>,
    },
    #[serde(rename = "permission.updated")]
    PermissionUpdated(PermissionAsk),
    #[serde(rename = "permission.replied")]
    PermissionReplied(PermissionReply),
    #[serde(rename = "file.edited")]
    FileEdited { path: String },
    #[serde(rename = "file.watcher.updated")]
    FileWatcherUpdated {
        #[serde(rename = "sessionID")]
        session_id: String,
        diff: SessionDiff,
    },
    /// Synthetic marker injected into a lagging subscriber's stream only;
    /// never published globally.
    #[serde(rename = "event.dropped")]
    Dropped { count: u64 },
}

impl Event {
    /// Event name as it appears on the wire (`session.updated`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Event::ServerConnected { .. } => "server.connected",
            Event::ProjectUpdated { .. } => "project.updated",
            Event::SessionUpdated { .. } => "session.updated",
            Event::SessionDeleted { .. } => "session.deleted",
            Event::SessionError { .. } => "session.error",
            Event::SessionIdle { .. } => "session.idle",
            Event::SessionCompacted { .. } => "session.compacted",
            Event::MessageUpdated { .. } => "message.updated",
            Event::MessagePartUpdated { .. } => "message.part.updated",
            Event::MessageRemoved { .. } => "message.removed",
            Event::TodoUpdated { .. } => "todo.updated",
            Event::PermissionUpdated(_) => "permission.updated",
            Event::PermissionReplied(_) => "permission.replied",
            Event::FileEdited { .. } => "file.edited",
            Event::FileWatcherUpdated { .. } => "file.watcher.updated",
            Event::Dropped { .. } => "event.dropped",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_dotted_type_names() {
        let e = Event::SessionIdle {
            session_id: "ses_1".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "session.idle");
        assert_eq!(v["properties"]["sessionID"], "ses_1");
    }

    #[test]
    fn name_matches_serialized_tag() {
        let events = [
            Event::ServerConnected {},
            Event::SessionDeleted {
                session_id: "s".into(),
            },
            Event::MessageRemoved {
                session_id: "s".into(),
                message_id: "m".into(),
            },
            Event::Dropped { count: 3 },
        ];
        for e in events {
            let v = serde_json::to_value(&e).unwrap();
            assert_eq!(v["type"], e.name());
        }
    }

    #[test]
    fn permission_reply_roundtrips() {
        let e = Event::PermissionReplied(PermissionReply {
            id: "per_1".into(),
            response: PermissionResponse::Always,
        });
        let text = serde_json::to_string(&e).unwrap();
        assert!(text.contains("\"always\""));
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, e);
    }
}
