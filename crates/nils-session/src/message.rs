// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NamedError;

/// Reference to a provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub read: u64,
    pub write: u64,
}

/// Token counters for one assistant message.  They only ever grow while
/// the message streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheUsage,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cache.read += other.cache.read;
        self.cache.write += other.cache.write;
    }

    /// Effective prompt-side size used for overflow checks.
    pub fn context_total(&self) -> u64 {
        self.input + self.output + self.cache.read
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: DateTime<Utc>,
    /// Set exactly once, when the message is finalised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePath {
    pub cwd: PathBuf,
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Agent name this prompt was addressed to.
    pub agent: String,
    pub model: ModelRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantInfo {
    /// The user message this assistant message responds to.
    #[serde(rename = "parentID")]
    pub parent_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    /// Snapshot of the system prompt blocks used for this turn.
    pub system: Vec<String>,
    pub mode: String,
    pub path: MessagePath,
    pub cost: f64,
    pub tokens: TokenUsage,
    /// True when this message is a compaction summary; prompt
    /// reconstruction restarts from the latest summary.
    #[serde(default)]
    pub summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NamedError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageRole {
    User(UserInfo),
    Assistant(AssistantInfo),
}

/// One message of a session.  Parts hold the content; the message itself
/// is ordering, causality, and accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: MessageTime,
    #[serde(flatten)]
    pub role: MessageRole,
}

impl Message {
    pub fn user(session_id: impl Into<String>, info: UserInfo) -> Self {
        Self {
            id: nils_id::ascending(nils_id::Kind::Message),
            session_id: session_id.into(),
            time: MessageTime {
                created: Utc::now(),
                completed: None,
            },
            role: MessageRole::User(info),
        }
    }

    pub fn assistant(session_id: impl Into<String>, info: AssistantInfo) -> Self {
        Self {
            id: nils_id::ascending(nils_id::Kind::Message),
            session_id: session_id.into(),
            time: MessageTime {
                created: Utc::now(),
                completed: None,
            },
            role: MessageRole::Assistant(info),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self.role, MessageRole::User(_))
    }

    pub fn as_assistant(&self) -> Option<&AssistantInfo> {
        match &self.role {
            MessageRole::Assistant(a) => Some(a),
            MessageRole::User(_) => None,
        }
    }

    pub fn as_assistant_mut(&mut self) -> Option<&mut AssistantInfo> {
        match &mut self.role {
            MessageRole::Assistant(a) => Some(a),
            MessageRole::User(_) => None,
        }
    }

    /// Finalise the message.  The completion time is monotonic: a second
    /// call leaves the original timestamp in place.
    pub fn complete(&mut self) {
        if self.time.completed.is_none() {
            self.time.completed = Some(Utc::now());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn user_info() -> UserInfo {
        UserInfo {
            agent: "build".into(),
            model: ModelRef {
                provider_id: "mock".into(),
                model_id: "mock-model".into(),
            },
            attachments: vec![],
        }
    }

    fn assistant_info(parent: &str) -> AssistantInfo {
        AssistantInfo {
            parent_id: parent.into(),
            model_id: "mock-model".into(),
            provider_id: "mock".into(),
            system: vec!["base".into()],
            mode: "build".into(),
            path: MessagePath::default(),
            cost: 0.0,
            tokens: TokenUsage::default(),
            summary: false,
            error: None,
        }
    }

    #[test]
    fn role_tag_serializes_lowercase() {
        let m = Message::user("ses_1", user_info());
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "user");

        let a = Message::assistant("ses_1", assistant_info(&m.id));
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["parentID"], m.id);
    }

    #[test]
    fn complete_is_set_once() {
        let mut m = Message::user("ses_1", user_info());
        m.complete();
        let first = m.time.completed;
        std::thread::sleep(std::time::Duration::from_millis(2));
        m.complete();
        assert_eq!(m.time.completed, first);
    }

    #[test]
    fn usage_accumulates_all_counters() {
        let mut u = TokenUsage::default();
        u.accumulate(&TokenUsage {
            input: 10,
            output: 5,
            reasoning: 2,
            cache: CacheUsage { read: 3, write: 1 },
        });
        u.accumulate(&TokenUsage {
            input: 1,
            output: 1,
            reasoning: 0,
            cache: CacheUsage { read: 0, write: 0 },
        });
        assert_eq!(u.input, 11);
        assert_eq!(u.output, 6);
        assert_eq!(u.reasoning, 2);
        assert_eq!(u.cache.read, 3);
        assert_eq!(u.context_total(), 11 + 6 + 3);
    }

    #[test]
    fn message_json_roundtrip() {
        let m = Message::user("ses_1", user_info());
        let text = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }
}
