// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Interactive permission gate.
//!
//! Policy evaluation is pure (`policy::evaluate`); this module owns the
//! interactive path: publish `permission.updated`, wait for the user's
//! reply, and persist `always` answers into the session's override
//! ruleset.  A pending ask is tied to the enclosing turn: when the turn's
//! cancellation token fires, the ask unwinds as `Aborted` like every
//! other suspension point.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nils_event::{Bus, Event, PermissionAsk, PermissionReply, PermissionResponse};
use nils_session::{PermissionAction, PermissionRule, Ruleset};
use nils_store::Store;

use crate::policy;
use crate::tool::ToolError;

pub struct AskRequest {
    pub tool: String,
    /// Tool-defined permission key (a path for file tools, the command for
    /// bash).
    pub key: String,
    /// Patterns the user may persist with an `always` reply; the first one
    /// becomes the new session rule.
    pub patterns: Vec<String>,
    pub metadata: Value,
    pub session_id: String,
    pub call_id: String,
    pub agent_rules: Ruleset,
    pub cancel: CancellationToken,
}

pub struct PermissionGate {
    bus: Arc<Bus>,
    store: Arc<Store>,
    /// Project-level rules from config, lowest precedence.
    base_rules: Ruleset,
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionResponse>>>,
}

impl PermissionGate {
    pub fn new(bus: Arc<Bus>, store: Arc<Store>, base_rules: Ruleset) -> Self {
        Self {
            bus,
            store,
            base_rules,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate and, if required, ask the user.  Returns `Ok(())` when the
    /// call may proceed.
    pub async fn ask(&self, req: AskRequest) -> Result<(), ToolError> {
        let session = self.store.get_session(&req.session_id).ok();
        let session_rules = session
            .as_ref()
            .and_then(|s| s.permissions.clone())
            .unwrap_or_default();
        let project_rules = session
            .as_ref()
            .and_then(|s| self.store.get_project_rules(&s.project_id).ok())
            .unwrap_or_default();

        let action = policy::evaluate(
            &req.tool,
            &req.key,
            &[
                &session_rules,
                &req.agent_rules,
                &project_rules,
                &self.base_rules,
            ],
        );
        match action {
            PermissionAction::Allow => Ok(()),
            PermissionAction::Deny => Err(ToolError::PermissionDenied(format!(
                "{}:{} denied by rule",
                req.tool, req.key
            ))),
            PermissionAction::Ask => self.interactive_ask(req).await,
        }
    }

    async fn interactive_ask(&self, req: AskRequest) -> Result<(), ToolError> {
        let id = nils_id::ascending(nils_id::Kind::Permission);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        self.bus.publish(Event::PermissionUpdated(PermissionAsk {
            id: id.clone(),
            session_id: req.session_id.clone(),
            call_id: req.call_id.clone(),
            patterns: req.patterns.clone(),
            metadata: req.metadata.clone(),
        }));
        debug!(%id, tool = %req.tool, key = %req.key, "permission ask pending");

        let response = tokio::select! {
            r = rx => r.unwrap_or(PermissionResponse::Reject),
            // The ask is a suspension point of the enclosing turn: its
            // cancellation unwinds as Aborted, never as a user rejection.
            _ = req.cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                return Err(ToolError::Aborted);
            }
        };

        match response {
            PermissionResponse::Once => Ok(()),
            PermissionResponse::Always => {
                self.persist_always(&req);
                Ok(())
            }
            PermissionResponse::Reject => Err(ToolError::PermissionDenied(format!(
                "{}:{} rejected by user",
                req.tool, req.key
            ))),
        }
    }

    /// Append the chosen pattern to the session's override ruleset.  The
    /// session row upsert is a single statement, so the append is atomic.
    fn persist_always(&self, req: &AskRequest) {
        let pattern = req
            .patterns
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{}:{}", req.tool, req.key));
        match self.store.get_session(&req.session_id) {
            Ok(mut session) => {
                let rules = session.permissions.get_or_insert_with(Ruleset::default);
                rules.push(PermissionRule::new(pattern, PermissionAction::Allow));
                if let Err(e) = self.store.upsert_session(&session) {
                    warn!(session = %req.session_id, "failed to persist always-rule: {e}");
                } else {
                    self.bus.publish(Event::SessionUpdated { session });
                }
            }
            Err(e) => warn!(session = %req.session_id, "always-rule lost: {e}"),
        }
    }

    /// Resolve a pending ask.  Returns false for unknown or already
    /// resolved ids.  Publishes `permission.replied` either way so UIs can
    /// drop stale prompts.
    pub fn reply(&self, id: &str, response: PermissionResponse) -> bool {
        let sender = self.pending.lock().unwrap().remove(id);
        self.bus.publish(Event::PermissionReplied(PermissionReply {
            id: id.to_string(),
            response,
        }));
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Number of asks currently waiting on the user.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
