// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Core data model: projects, sessions, messages, parts, todos, permission
//! rules, diffs, and the structured error taxonomy.
//!
//! All entities serialize with serde; the store keeps them as JSON blobs
//! keyed by their sortable ids, so cross-entity references are always ids,
//! never owning pointers.
mod diff;
mod error;
mod message;
mod part;
mod permission;
mod project;
mod session;
mod todo;

pub use diff::{FileDiff, SessionDiff};
pub use error::{ErrorKind, NamedError};
pub use message::{
    AssistantInfo, CacheUsage, Message, MessagePath, MessageRole, MessageTime, ModelRef,
    TokenUsage, UserInfo,
};
pub use part::{Part, PartBody, TimeSpan, ToolState, ToolStateTime};
pub use permission::{PermissionAction, PermissionRule, Ruleset};
pub use project::{Project, ProjectIcon, ProjectTime, VcsKind, GLOBAL_PROJECT_ID};
pub use session::{RevertAnchor, Session, SessionSummary, SessionTime, ShareInfo};
pub use todo::{TodoItem, TodoPriority, TodoStatus};
