// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Context-window management.
//!
//! Two mechanisms, in escalation order: **prune** marks old completed tool
//! outputs as elided (pure metadata, reversible in spirit), **compact**
//! replaces history with a model-written summary message.  Overflow
//! detection lives here too; the turn engine calls [`is_overflow`] after
//! every finish-step.
use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use nils_event::{Bus, Event};
use nils_model::{ChatMessage, ModelInfo};
use nils_session::{Message, MessageRole, Part, PartBody, TokenUsage, ToolState};
use nils_store::{Store, StoreError};

/// Reserve for model output when computing the usable context, capped so
/// huge output limits do not eat the whole window.
pub const OUTPUT_HARD_CAP: u64 = 32_000;

/// Token estimate of recent tool output that prune never touches.
pub const PRUNE_PROTECT: u64 = 40_000;
/// Prune only acts when it can free more than this.
pub const PRUNE_MINIMUM: u64 = 20_000;

/// Number of most recent user turns whose parts are never pruned.
const PRUNE_KEEP_TURNS: usize = 2;

/// True when the accumulated context no longer fits the model.
pub fn is_overflow(tokens: &TokenUsage, model: &ModelInfo) -> bool {
    let reserved = model.max_output_tokens.min(OUTPUT_HARD_CAP);
    tokens.context_total() > model.context_window.saturating_sub(reserved)
}

/// chars/4: the usual rough token estimate.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Walk parts newest to oldest, skipping the last two user turns.  The
/// first `PRUNE_PROTECT` estimated tokens of completed tool output stay;
/// older outputs are marked `compacted` when doing so frees more than
/// `PRUNE_MINIMUM`.  Pure metadata change; never mutates text.  Returns
/// the number of parts marked.
pub fn prune(store: &Store, bus: &Bus, session_id: &str) -> Result<usize, StoreError> {
    let messages = store.list_messages(session_id)?;
    // Everything at or after the cutoff message is untouchable.
    let cutoff = messages
        .iter()
        .filter(|m| m.is_user())
        .rev()
        .nth(PRUNE_KEEP_TURNS - 1)
        .map(|m| m.id.clone())
        .unwrap_or_default();

    let mut parts = store.list_session_parts(session_id)?;
    parts.retain(|p| p.message_id < cutoff);

    let mut protected = 0u64;
    let mut candidates: Vec<(Part, u64)> = Vec::new();
    for part in parts.into_iter().rev() {
        let PartBody::Tool {
            state:
                ToolState::Completed {
                    ref output,
                    ref time,
                    ..
                },
            ..
        } = part.body
        else {
            continue;
        };
        if time.compacted.is_some() {
            continue;
        }
        let estimate = estimate_tokens(output);
        if protected < PRUNE_PROTECT {
            protected += estimate;
        } else {
            candidates.push((part, estimate));
        }
    }

    let prunable: u64 = candidates.iter().map(|(_, e)| e).sum();
    if prunable <= PRUNE_MINIMUM {
        return Ok(0);
    }

    let now = Utc::now();
    let count = candidates.len();
    for (mut part, _) in candidates {
        if let PartBody::Tool {
            state: ToolState::Completed { ref mut time, .. },
            ..
        } = part.body
        {
            time.compacted = Some(now);
        }
        store.upsert_part(&part)?;
        bus.publish(Event::MessagePartUpdated { part });
    }
    debug!(session = session_id, pruned = count, "pruned tool outputs");
    Ok(count)
}

/// Flatten stored messages and parts into the provider wire shape.
///
/// Reconstruction starts at the latest completed summary message; elided
/// (`compacted`) tool outputs are replaced with a marker while the store
/// keeps the full text for the UI.
pub fn reconstruct(messages: &[Message], parts: &HashMap<String, Vec<Part>>) -> Vec<ChatMessage> {
    let start = messages
        .iter()
        .rposition(|m| {
            m.as_assistant()
                .map(|a| a.summary && m.time.completed.is_some())
                .unwrap_or(false)
        })
        .unwrap_or(0);

    let mut chat = Vec::new();
    for message in &messages[start..] {
        let empty = Vec::new();
        let message_parts = parts.get(&message.id).unwrap_or(&empty);
        match &message.role {
            MessageRole::User(_) => {
                let mut text = String::new();
                for part in message_parts {
                    match &part.body {
                        PartBody::Text { text: t, .. } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        PartBody::File { filename, mime, .. } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&format!("[attachment: {filename} ({mime})]"));
                        }
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    chat.push(ChatMessage::user(text));
                }
            }
            MessageRole::Assistant(_) => {
                let mut text = String::new();
                for part in message_parts {
                    match &part.body {
                        PartBody::Text { text: t, .. } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        PartBody::Tool {
                            call_id,
                            tool,
                            state,
                        } => {
                            if !text.is_empty() {
                                chat.push(ChatMessage::assistant(std::mem::take(&mut text)));
                            }
                            match state {
                                ToolState::Completed {
                                    input,
                                    output,
                                    time,
                                    ..
                                } => {
                                    chat.push(ChatMessage::tool_call(
                                        call_id,
                                        tool,
                                        input.to_string(),
                                    ));
                                    let content = if time.compacted.is_some() {
                                        "[old tool output elided]".to_string()
                                    } else {
                                        output.clone()
                                    };
                                    chat.push(ChatMessage::tool_result(call_id, content));
                                }
                                ToolState::Error { input, error, .. } => {
                                    chat.push(ChatMessage::tool_call(
                                        call_id,
                                        tool,
                                        input.to_string(),
                                    ));
                                    chat.push(ChatMessage::tool_result(
                                        call_id,
                                        format!("error: {error}"),
                                    ));
                                }
                                ToolState::Pending { .. } => {}
                            }
                        }
                        // Reasoning and step markers never replay.
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    chat.push(ChatMessage::assistant(text));
                }
            }
        }
    }
    chat
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_session::{
        AssistantInfo, MessagePath, ModelRef, Session, ToolStateTime, UserInfo,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn model(context: u64, output: u64) -> ModelInfo {
        ModelInfo {
            context_window: context,
            max_output_tokens: output,
        }
    }

    fn usage(input: u64, output: u64, cache_read: u64) -> TokenUsage {
        TokenUsage {
            input,
            output,
            reasoning: 0,
            cache: nils_session::CacheUsage {
                read: cache_read,
                write: 0,
            },
        }
    }

    #[test]
    fn overflow_at_exactly_the_boundary() {
        let m = model(10_000, 2_000);
        // usable = 10_000 - 2_000 = 8_000
        assert!(!is_overflow(&usage(8_000, 0, 0), &m));
        assert!(is_overflow(&usage(8_001, 0, 0), &m));
        assert!(is_overflow(&usage(4_000, 2_000, 2_001), &m));
    }

    #[test]
    fn output_reserve_is_capped() {
        let m = model(100_000, 1_000_000);
        // reserve = min(1_000_000, 32_000)
        assert!(!is_overflow(&usage(68_000, 0, 0), &m));
        assert!(is_overflow(&usage(68_001, 0, 0), &m));
    }

    // ── prune ────────────────────────────────────────────────────────────────

    struct Fixture {
        store: Arc<Store>,
        bus: Arc<Bus>,
        session: Session,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new());
        let project = nils_session::Project::new("prj_t", "/w");
        store.upsert_project(&project).unwrap();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();
        Fixture {
            store,
            bus,
            session,
        }
    }

    fn user_msg(f: &Fixture) -> Message {
        let m = Message::user(
            &f.session.id,
            UserInfo {
                agent: "build".into(),
                model: ModelRef {
                    provider_id: "mock".into(),
                    model_id: "m".into(),
                },
                attachments: vec![],
            },
        );
        f.store.upsert_message(&m).unwrap();
        m
    }

    fn assistant_msg(f: &Fixture, parent: &str) -> Message {
        let mut m = Message::assistant(
            &f.session.id,
            AssistantInfo {
                parent_id: parent.into(),
                model_id: "m".into(),
                provider_id: "mock".into(),
                system: vec![],
                mode: "build".into(),
                path: MessagePath::default(),
                cost: 0.0,
                tokens: TokenUsage::default(),
                summary: false,
                error: None,
            },
        );
        m.complete();
        f.store.upsert_message(&m).unwrap();
        m
    }

    fn tool_part(f: &Fixture, message_id: &str, output: String) -> Part {
        let now = Utc::now();
        let p = Part::new(
            &f.session.id,
            message_id,
            PartBody::Tool {
                call_id: nils_id::ascending(nils_id::Kind::Part),
                tool: "read".into(),
                state: ToolState::Completed {
                    input: json!({}),
                    output,
                    title: "read".into(),
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
        f.store.upsert_part(&p).unwrap();
        p
    }

    /// Old turn with huge tool output, then two fresh user turns.
    fn seed_prunable(f: &Fixture) {
        let old_user = user_msg(f);
        let old_asst = assistant_msg(f, &old_user.id);
        // Well past protect + minimum: 3 outputs of ~100k tokens each.
        for _ in 0..3 {
            tool_part(f, &old_asst.id, "x".repeat(400_000));
        }
        let recent_user = user_msg(f);
        let recent_asst = assistant_msg(f, &recent_user.id);
        tool_part(f, &recent_asst.id, "fresh".into());
        let last_user = user_msg(f);
        let _ = assistant_msg(f, &last_user.id);
    }

    #[test]
    fn prune_marks_old_outputs_only() {
        let f = fixture();
        seed_prunable(&f);
        let pruned = prune(&f.store, &f.bus, &f.session.id).unwrap();
        assert!(pruned >= 1);
        let parts = f.store.list_session_parts(&f.session.id).unwrap();
        // The fresh output (inside the last two user turns) is untouched.
        let fresh = parts
            .iter()
            .find(|p| matches!(&p.body, PartBody::Tool { state: ToolState::Completed { output, .. }, .. } if output == "fresh"))
            .unwrap();
        assert!(!fresh.is_compacted_tool());
        assert!(parts.iter().any(|p| p.is_compacted_tool()));
    }

    #[test]
    fn prune_is_idempotent() {
        let f = fixture();
        seed_prunable(&f);
        let first = prune(&f.store, &f.bus, &f.session.id).unwrap();
        assert!(first >= 1);
        let second = prune(&f.store, &f.bus, &f.session.id).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn prune_leaves_small_sessions_alone() {
        let f = fixture();
        let u = user_msg(&f);
        let a = assistant_msg(&f, &u.id);
        tool_part(&f, &a.id, "tiny".into());
        assert_eq!(prune(&f.store, &f.bus, &f.session.id).unwrap(), 0);
    }

    // ── reconstruct ──────────────────────────────────────────────────────────

    fn parts_map(f: &Fixture) -> HashMap<String, Vec<Part>> {
        let mut map: HashMap<String, Vec<Part>> = HashMap::new();
        for p in f.store.list_session_parts(&f.session.id).unwrap() {
            map.entry(p.message_id.clone()).or_default().push(p);
        }
        map
    }

    #[test]
    fn reconstruct_pairs_tool_calls_with_results() {
        let f = fixture();
        let u = user_msg(&f);
        f.store
            .upsert_part(&Part::text(&f.session.id, &u.id, "question"))
            .unwrap();
        let a = assistant_msg(&f, &u.id);
        tool_part(&f, &a.id, "file content".into());
        f.store
            .upsert_part(&Part::text(&f.session.id, &a.id, "answer"))
            .unwrap();

        let messages = f.store.list_messages(&f.session.id).unwrap();
        let chat = reconstruct(&messages, &parts_map(&f));
        assert_eq!(chat.len(), 4);
        assert_eq!(chat[0].as_text(), Some("question"));
        assert!(matches!(
            &chat[1].content,
            nils_model::ChatContent::ToolCall { .. }
        ));
        assert!(matches!(
            &chat[2].content,
            nils_model::ChatContent::ToolResult { content, .. } if content == "file content"
        ));
        assert_eq!(chat[3].as_text(), Some("answer"));
    }

    #[test]
    fn compacted_outputs_are_elided_from_replay() {
        let f = fixture();
        let u = user_msg(&f);
        let a = assistant_msg(&f, &u.id);
        let mut p = tool_part(&f, &a.id, "secret megabytes".into());
        if let PartBody::Tool {
            state: ToolState::Completed { ref mut time, .. },
            ..
        } = p.body
        {
            time.compacted = Some(Utc::now());
        }
        f.store.upsert_part(&p).unwrap();

        let messages = f.store.list_messages(&f.session.id).unwrap();
        let chat = reconstruct(&messages, &parts_map(&f));
        let result = chat
            .iter()
            .find_map(|m| match &m.content {
                nils_model::ChatContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result, "[old tool output elided]");
        // The store still returns the full output for the UI.
        let stored = f.store.get_part(&p.id).unwrap();
        assert!(matches!(
            stored.body,
            PartBody::Tool { state: ToolState::Completed { ref output, .. }, .. }
            if output == "secret megabytes"
        ));
    }

    #[test]
    fn reconstruct_restarts_at_latest_summary() {
        let f = fixture();
        let u1 = user_msg(&f);
        f.store
            .upsert_part(&Part::text(&f.session.id, &u1.id, "ancient history"))
            .unwrap();
        let _a1 = assistant_msg(&f, &u1.id);

        let mut summary = Message::assistant(
            &f.session.id,
            AssistantInfo {
                parent_id: u1.id.clone(),
                model_id: "m".into(),
                provider_id: "mock".into(),
                system: vec![],
                mode: "build".into(),
                path: MessagePath::default(),
                cost: 0.0,
                tokens: TokenUsage::default(),
                summary: true,
                error: None,
            },
        );
        summary.complete();
        f.store.upsert_message(&summary).unwrap();
        f.store
            .upsert_part(&Part::text(&f.session.id, &summary.id, "the summary"))
            .unwrap();

        let u2 = user_msg(&f);
        f.store
            .upsert_part(&Part::text(&f.session.id, &u2.id, "new question"))
            .unwrap();

        let messages = f.store.list_messages(&f.session.id).unwrap();
        let chat = reconstruct(&messages, &parts_map(&f));
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].as_text(), Some("the summary"));
        assert_eq!(chat[1].as_text(), Some("new question"));
    }

    #[test]
    fn synthetic_text_is_fed_to_the_model() {
        let f = fixture();
        let u = user_msg(&f);
        f.store
            .upsert_part(&Part::synthetic_text(&f.session.id, &u.id, "hidden context"))
            .unwrap();
        let messages = f.store.list_messages(&f.session.id).unwrap();
        let chat = reconstruct(&messages, &parts_map(&f));
        assert_eq!(chat[0].as_text(), Some("hidden context"));
    }
}
