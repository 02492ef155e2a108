// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NamedError;
use crate::message::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeSpan {
    pub fn open() -> Self {
        Self {
            start: Utc::now(),
            end: None,
        }
    }

    pub fn close(&mut self) {
        if self.end.is_none() {
            self.end = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolStateTime {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// When set, the output is elided from prompt reconstruction; the UI
    /// still reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<DateTime<Utc>>,
}

/// Tool part state machine: `pending` then exactly one of
/// `completed | error`, never revisited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        metadata: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
        time: ToolStateTime,
    },
    Error {
        input: Value,
        error: NamedError,
        time: ToolStateTime,
    },
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolState::Pending { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartBody {
    /// Streamed assistant text, or synthetic user text that the UI hides
    /// but the model still sees.
    Text {
        text: String,
        #[serde(default)]
        synthetic: bool,
    },
    Reasoning {
        text: String,
        time: TimeSpan,
    },
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        state: ToolState,
    },
    File {
        mime: String,
        url: String,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_path: Option<String>,
    },
    StepStart {},
    StepFinish {
        usage: TokenUsage,
        cost: f64,
    },
    Patch {
        files: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
}

/// The atomic content unit inside a message.  Part ids are sortable and
/// strictly increasing within their message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

impl Part {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        body: PartBody,
    ) -> Self {
        Self {
            id: nils_id::ascending(nils_id::Kind::Part),
            message_id: message_id.into(),
            session_id: session_id.into(),
            body,
        }
    }

    pub fn text(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            message_id,
            PartBody::Text {
                text: text.into(),
                synthetic: false,
            },
        )
    }

    pub fn synthetic_text(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            message_id,
            PartBody::Text {
                text: text.into(),
                synthetic: true,
            },
        )
    }

    pub fn as_tool(&self) -> Option<(&str, &str, &ToolState)> {
        match &self.body {
            PartBody::Tool {
                call_id,
                tool,
                state,
            } => Some((call_id, tool, state)),
            _ => None,
        }
    }

    /// True for completed tool parts whose output has been marked compacted.
    pub fn is_compacted_tool(&self) -> bool {
        matches!(
            &self.body,
            PartBody::Tool {
                state: ToolState::Completed { time, .. },
                ..
            } if time.compacted.is_some()
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_ids_increase_within_a_message() {
        let a = Part::text("ses_1", "msg_1", "one");
        let b = Part::text("ses_1", "msg_1", "two");
        assert!(a.id < b.id);
    }

    #[test]
    fn type_tag_is_kebab_case() {
        let p = Part::new(
            "ses_1",
            "msg_1",
            PartBody::StepFinish {
                usage: TokenUsage::default(),
                cost: 0.0,
            },
        );
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "step-finish");
    }

    #[test]
    fn tool_state_tags_by_status() {
        let p = Part::new(
            "ses_1",
            "msg_1",
            PartBody::Tool {
                call_id: "call_1".into(),
                tool: "read".into(),
                state: ToolState::Pending {
                    input: json!({"filePath": "./x"}),
                    raw: None,
                },
            },
        );
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["state"]["status"], "pending");
        assert!(!p.as_tool().unwrap().2.is_terminal());
    }

    #[test]
    fn terminal_states_are_terminal() {
        let now = Utc::now();
        let completed = ToolState::Completed {
            input: json!({}),
            output: "ok".into(),
            title: "read".into(),
            metadata: json!({}),
            attachments: vec![],
            time: ToolStateTime {
                start: now,
                end: now,
                compacted: None,
            },
        };
        let error = ToolState::Error {
            input: json!({}),
            error: crate::NamedError::aborted(),
            time: ToolStateTime {
                start: now,
                end: now,
                compacted: None,
            },
        };
        assert!(completed.is_terminal());
        assert!(error.is_terminal());
    }

    #[test]
    fn compacted_flag_detected() {
        let now = Utc::now();
        let mut p = Part::new(
            "ses_1",
            "msg_1",
            PartBody::Tool {
                call_id: "c".into(),
                tool: "read".into(),
                state: ToolState::Completed {
                    input: json!({}),
                    output: "big".into(),
                    title: "t".into(),
                    metadata: json!({}),
                    attachments: vec![],
                    time: ToolStateTime {
                        start: now,
                        end: now,
                        compacted: None,
                    },
                },
            },
        );
        assert!(!p.is_compacted_tool());
        if let PartBody::Tool {
            state: ToolState::Completed { time, .. },
            ..
        } = &mut p.body
        {
            time.compacted = Some(now);
        }
        assert!(p.is_compacted_tool());
    }

    #[test]
    fn synthetic_text_flag_roundtrips() {
        let p = Part::synthetic_text("ses_1", "msg_1", "hidden");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["synthetic"], true);
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
