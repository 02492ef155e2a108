// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    Low,
    Medium,
    High,
}

/// One entry of a session's todo list.  The list is replaced wholesale on
/// every update and an update event is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(TodoStatus::InProgress).unwrap(),
            "in_progress"
        );
        assert_eq!(
            serde_json::to_value(TodoStatus::Cancelled).unwrap(),
            "cancelled"
        );
    }

    #[test]
    fn item_roundtrips() {
        let item = TodoItem {
            id: "1".into(),
            content: "write tests".into(),
            status: TodoStatus::Pending,
            priority: TodoPriority::High,
        };
        let text = serde_json::to_string(&item).unwrap();
        let back: TodoItem = serde_json::from_str(&text).unwrap();
        assert_eq!(back, item);
    }
}
