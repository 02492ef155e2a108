// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Canonical error kinds.  The names are part of the wire format: they are
/// persisted inside assistant messages and tool parts and returned verbatim
/// in HTTP error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The user cancelled; the session lock token fired.
    Aborted,
    /// The provider rejected credentials.
    AuthError,
    /// The provider signalled output truncation.
    OutputLengthError,
    /// Context exceeds the limit and compaction is disabled.
    OverflowError,
    /// A turn is already running on this session.
    Busy,
    /// A validate hook blocked the tool call.
    ToolBlocked,
    /// The permission gate denied, or the user rejected the ask.
    PermissionDenied,
    /// Unknown entity id.
    NotFound,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Aborted => "Aborted",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::OutputLengthError => "OutputLengthError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::Busy => "Busy",
            ErrorKind::ToolBlocked => "ToolBlocked",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

/// A taxonomy error with a human-readable message.  Serializes as
/// `{"type": "<kind>", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct NamedError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl NamedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "the turn was aborted")
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found: {id}"))
    }

    pub fn busy(session_id: &str) -> Self {
        Self::new(
            ErrorKind::Busy,
            format!("session {session_id} already has an active turn"),
        )
    }

    /// True for kinds that end the whole turn (as opposed to tool-local
    /// failures, which the turn survives).
    pub fn is_turn_fatal(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::ToolBlocked | ErrorKind::PermissionDenied
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_field() {
        let e = NamedError::new(ErrorKind::AuthError, "bad key");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "AuthError");
        assert_eq!(v["message"], "bad key");
    }

    #[test]
    fn kind_names_are_stable() {
        for (kind, name) in [
            (ErrorKind::Aborted, "Aborted"),
            (ErrorKind::OutputLengthError, "OutputLengthError"),
            (ErrorKind::PermissionDenied, "PermissionDenied"),
        ] {
            assert_eq!(kind.as_str(), name);
            assert_eq!(serde_json::to_value(kind).unwrap(), name);
        }
    }

    #[test]
    fn tool_local_kinds_are_not_turn_fatal() {
        assert!(!NamedError::new(ErrorKind::ToolBlocked, "x").is_turn_fatal());
        assert!(!NamedError::new(ErrorKind::PermissionDenied, "x").is_turn_fatal());
        assert!(NamedError::new(ErrorKind::AuthError, "x").is_turn_fatal());
        assert!(NamedError::aborted().is_turn_fatal());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = NamedError::busy("ses_1");
        assert!(e.to_string().starts_with("Busy:"));
        assert!(e.to_string().contains("ses_1"));
    }
}
