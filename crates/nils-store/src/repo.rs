// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Repository layer: typed CRUD over the schema in `db.rs`.
//!
//! Single-row writes are upserts (`ON CONFLICT DO UPDATE`); multi-row
//! writes of one persistence step share a transaction via
//! [`Store::with_tx`].  Lists come back ordered by id, which is creation
//! order thanks to the sortable id scheme.
use rusqlite::{params, OptionalExtension, Transaction};

use nils_session::{
    Message, Part, Project, Ruleset, Session, SessionDiff, ShareInfo, TodoItem,
};

use crate::db::{Store, StoreError};

// ── Projects ─────────────────────────────────────────────────────────────────

pub(crate) fn tx_upsert_project(tx: &Transaction<'_>, p: &Project) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO project (id, worktree, vcs, name, icon_url, icon_color,
                              time_created, time_updated, time_initialized, sandboxes_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             worktree = excluded.worktree,
             vcs = excluded.vcs,
             name = excluded.name,
             icon_url = excluded.icon_url,
             icon_color = excluded.icon_color,
             time_updated = excluded.time_updated,
             time_initialized = excluded.time_initialized,
             sandboxes_json = excluded.sandboxes_json",
        params![
            p.id,
            p.worktree.to_string_lossy(),
            p.vcs.map(|v| serde_json::to_string(&v).unwrap_or_default()),
            p.name,
            p.icon.as_ref().and_then(|i| i.url.clone()),
            p.icon.as_ref().and_then(|i| i.color.clone()),
            p.time.created.to_rfc3339(),
            p.time.updated.to_rfc3339(),
            p.time.initialized.map(|t| t.to_rfc3339()),
            serde_json::to_string(&p.sandboxes)?,
        ],
    )?;
    Ok(())
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let sandboxes: String = row.get("sandboxes_json")?;
    let vcs: Option<String> = row.get("vcs")?;
    let icon_url: Option<String> = row.get("icon_url")?;
    let icon_color: Option<String> = row.get("icon_color")?;
    let created: String = row.get("time_created")?;
    let updated: String = row.get("time_updated")?;
    let initialized: Option<String> = row.get("time_initialized")?;
    let parse = |s: &str| {
        chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now())
    };
    Ok(Project {
        id: row.get("id")?,
        worktree: std::path::PathBuf::from(row.get::<_, String>("worktree")?),
        vcs: vcs.and_then(|v| serde_json::from_str(&v).ok()),
        name: row.get("name")?,
        icon: if icon_url.is_some() || icon_color.is_some() {
            Some(nils_session::ProjectIcon {
                url: icon_url,
                color: icon_color,
            })
        } else {
            None
        },
        time: nils_session::ProjectTime {
            created: parse(&created),
            updated: parse(&updated),
            initialized: initialized.as_deref().map(parse),
        },
        sandboxes: serde_json::from_str(&sandboxes).unwrap_or_default(),
    })
}

impl Store {
    pub fn upsert_project(&self, p: &Project) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_upsert_project(tx, p))
    }

    pub fn get_project(&self, id: &str) -> Result<Project, StoreError> {
        let conn = self.lock();
        conn.query_row("SELECT * FROM project WHERE id = ?1", [id], row_to_project)
            .optional()?
            .ok_or_else(|| StoreError::NotFound("project", id.to_string()))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM project ORDER BY id")?;
        let rows = stmt.query_map([], row_to_project)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn upsert_session(&self, s: &Session) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_upsert_session(tx, s))
    }

    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT data_json FROM session WHERE id = ?1",
            [id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .transpose()?
        .ok_or_else(|| StoreError::NotFound("session", id.to_string()))
    }

    pub fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT data_json FROM session WHERE project_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([project_id], |row| row.get::<_, String>(0))?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str(&row?)?);
        }
        Ok(sessions)
    }

    /// Drop a session and everything it owns (messages, parts, todos,
    /// diffs, share) via FK cascade.
    pub fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM session WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(StoreError::NotFound("session", id.to_string()));
        }
        Ok(())
    }

    // ── Messages & parts ─────────────────────────────────────────────────────

    pub fn upsert_message(&self, m: &Message) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_upsert_message(tx, m))
    }

    pub fn get_message(&self, id: &str) -> Result<Message, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT data_json FROM message WHERE id = ?1",
            [id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .transpose()?
        .ok_or_else(|| StoreError::NotFound("message", id.to_string()))
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT data_json FROM message WHERE session_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    pub fn remove_message(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM message WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(StoreError::NotFound("message", id.to_string()));
        }
        Ok(())
    }

    pub fn upsert_part(&self, p: &Part) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_upsert_part(tx, p))
    }

    pub fn get_part(&self, id: &str) -> Result<Part, StoreError> {
        let conn = self.lock();
        conn.query_row("SELECT data_json FROM part WHERE id = ?1", [id], |row| {
            row.get::<_, String>(0)
        })
        .optional()?
        .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .transpose()?
        .ok_or_else(|| StoreError::NotFound("part", id.to_string()))
    }

    pub fn list_parts(&self, message_id: &str) -> Result<Vec<Part>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT data_json FROM part WHERE message_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([message_id], |row| row.get::<_, String>(0))?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(serde_json::from_str(&row?)?);
        }
        Ok(parts)
    }

    pub fn list_session_parts(&self, session_id: &str) -> Result<Vec<Part>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT data_json FROM part WHERE session_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;
        let mut parts = Vec::new();
        for row in rows {
            parts.push(serde_json::from_str(&row?)?);
        }
        Ok(parts)
    }

    /// Persist a message together with its parts in one transaction: the
    /// atomic persistence step of a turn tick.
    pub fn persist_message_with_parts(
        &self,
        message: &Message,
        parts: &[Part],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx_upsert_message(tx, message)?;
            for part in parts {
                tx_upsert_part(tx, part)?;
            }
            Ok(())
        })
    }

    // ── Todos, diffs, permissions, shares ────────────────────────────────────

    pub fn set_todos(&self, session_id: &str, todos: &[TodoItem]) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO todo (session_id, data_json) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET data_json = excluded.data_json",
            params![session_id, serde_json::to_string(todos)?],
        )?;
        Ok(())
    }

    pub fn get_todos(&self, session_id: &str) -> Result<Vec<TodoItem>, StoreError> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM todo WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => serde_json::from_str(&j)?,
            None => Vec::new(),
        })
    }

    pub fn set_session_diff(
        &self,
        session_id: &str,
        diff: &SessionDiff,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_diff (session_id, data_json) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET data_json = excluded.data_json",
            params![session_id, serde_json::to_string(diff)?],
        )?;
        Ok(())
    }

    pub fn get_session_diff(&self, session_id: &str) -> Result<SessionDiff, StoreError> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM session_diff WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => serde_json::from_str(&j)?,
            None => SessionDiff::default(),
        })
    }

    pub fn set_project_rules(
        &self,
        project_id: &str,
        rules: &Ruleset,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO permission (project_id, data_json) VALUES (?1, ?2)
             ON CONFLICT(project_id) DO UPDATE SET data_json = excluded.data_json",
            params![project_id, serde_json::to_string(rules)?],
        )?;
        Ok(())
    }

    pub fn get_project_rules(&self, project_id: &str) -> Result<Ruleset, StoreError> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM permission WHERE project_id = ?1",
                [project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => serde_json::from_str(&j)?,
            None => Ruleset::default(),
        })
    }

    pub fn set_share(&self, session_id: &str, share: &ShareInfo) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_share (session_id, data_json) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET data_json = excluded.data_json",
            params![session_id, serde_json::to_string(share)?],
        )?;
        Ok(())
    }

    pub fn get_share(&self, session_id: &str) -> Result<Option<ShareInfo>, StoreError> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT data_json FROM session_share WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        })
    }

    pub fn delete_share(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM session_share WHERE session_id = ?1",
            [session_id],
        )?;
        Ok(())
    }
}

// ── Transaction-level writers (shared with the importer) ─────────────────────

pub(crate) fn tx_upsert_session(tx: &Transaction<'_>, s: &Session) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO session (id, project_id, parent_id, created_at, updated_at, data_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             parent_id = excluded.parent_id,
             updated_at = excluded.updated_at,
             data_json = excluded.data_json",
        params![
            s.id,
            s.project_id,
            s.parent_id,
            s.time.created.to_rfc3339(),
            s.time.updated.to_rfc3339(),
            serde_json::to_string(s)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn tx_upsert_message(tx: &Transaction<'_>, m: &Message) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO message (id, session_id, created_at, data_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json",
        params![
            m.id,
            m.session_id,
            m.time.created.to_rfc3339(),
            serde_json::to_string(m)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn tx_upsert_part(tx: &Transaction<'_>, p: &Part) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO part (id, message_id, session_id, data_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json",
        params![
            p.id,
            p.message_id,
            p.session_id,
            serde_json::to_string(p)?,
        ],
    )?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_session::{
        MessagePath, MessageRole, ModelRef, PermissionAction, PermissionRule, TokenUsage,
        UserInfo,
    };

    fn store_with_project() -> (Store, Project) {
        let store = Store::open_in_memory().unwrap();
        let project = Project::new("prj_test", "/w");
        store.upsert_project(&project).unwrap();
        (store, project)
    }

    fn user_message(session_id: &str) -> Message {
        Message::user(
            session_id,
            UserInfo {
                agent: "build".into(),
                model: ModelRef {
                    provider_id: "mock".into(),
                    model_id: "mock-model".into(),
                },
                attachments: vec![],
            },
        )
    }

    #[test]
    fn project_roundtrip() {
        let (store, project) = store_with_project();
        let back = store.get_project(&project.id).unwrap();
        assert_eq!(back.id, project.id);
        assert_eq!(back.worktree, project.worktree);
    }

    #[test]
    fn session_crud_and_ordering() {
        let (store, project) = store_with_project();
        let a = Session::new(&project.id, "/w");
        let b = Session::new(&project.id, "/w");
        store.upsert_session(&b).unwrap();
        store.upsert_session(&a).unwrap();
        let list = store.list_sessions(&project.id).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].id < list[1].id);
        assert_eq!(store.get_session(&a.id).unwrap().id, a.id);
    }

    #[test]
    fn get_missing_session_is_not_found() {
        let (store, _) = store_with_project();
        match store.get_session("ses_missing") {
            Err(StoreError::NotFound(kind, _)) => assert_eq!(kind, "session"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn cascade_delete_drops_owned_rows() {
        let (store, project) = store_with_project();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();
        let msg = user_message(&session.id);
        let part = Part::text(&session.id, &msg.id, "hello");
        store.persist_message_with_parts(&msg, &[part]).unwrap();
        store
            .set_todos(
                &session.id,
                &[TodoItem {
                    id: "1".into(),
                    content: "x".into(),
                    status: nils_session::TodoStatus::Pending,
                    priority: nils_session::TodoPriority::Low,
                }],
            )
            .unwrap();

        store.delete_session(&session.id).unwrap();

        assert!(store.list_messages(&session.id).unwrap().is_empty());
        assert!(store.list_session_parts(&session.id).unwrap().is_empty());
        assert!(store.get_todos(&session.id).unwrap().is_empty());
    }

    #[test]
    fn message_upsert_replaces_payload() {
        let (store, project) = store_with_project();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();
        let mut msg = user_message(&session.id);
        store.upsert_message(&msg).unwrap();
        msg.complete();
        store.upsert_message(&msg).unwrap();
        let back = store.get_message(&msg.id).unwrap();
        assert!(back.time.completed.is_some());
        assert_eq!(store.list_messages(&session.id).unwrap().len(), 1);
    }

    #[test]
    fn parts_list_in_id_order() {
        let (store, project) = store_with_project();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();
        let msg = user_message(&session.id);
        let parts: Vec<Part> = (0..5)
            .map(|i| Part::text(&session.id, &msg.id, format!("p{i}")))
            .collect();
        store.persist_message_with_parts(&msg, &parts).unwrap();
        let listed = store.list_parts(&msg.id).unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn rules_and_diff_and_share_roundtrip() {
        let (store, project) = store_with_project();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();

        let rules = Ruleset(vec![PermissionRule::new("read:*", PermissionAction::Allow)]);
        store.set_project_rules(&project.id, &rules).unwrap();
        assert_eq!(store.get_project_rules(&project.id).unwrap(), rules);

        let mut diff = SessionDiff::default();
        diff.upsert(nils_session::FileDiff {
            path: "a.rs".into(),
            additions: 1,
            deletions: 0,
            diff: "+x".into(),
        });
        store.set_session_diff(&session.id, &diff).unwrap();
        assert_eq!(store.get_session_diff(&session.id).unwrap(), diff);

        let share = ShareInfo {
            id: "sh".into(),
            secret: "sec".into(),
            url: "https://x".into(),
        };
        store.set_share(&session.id, &share).unwrap();
        assert_eq!(store.get_share(&session.id).unwrap(), Some(share));
        store.delete_share(&session.id).unwrap();
        assert_eq!(store.get_share(&session.id).unwrap(), None);
    }

    #[test]
    fn assistant_message_roundtrips_tokens() {
        let (store, project) = store_with_project();
        let session = Session::new(&project.id, "/w");
        store.upsert_session(&session).unwrap();
        let user = user_message(&session.id);
        store.upsert_message(&user).unwrap();
        let mut asst = Message::assistant(
            &session.id,
            nils_session::AssistantInfo {
                parent_id: user.id.clone(),
                model_id: "m".into(),
                provider_id: "p".into(),
                system: vec![],
                mode: "build".into(),
                path: MessagePath::default(),
                cost: 0.5,
                tokens: TokenUsage::default(),
                summary: false,
                error: None,
            },
        );
        if let MessageRole::Assistant(info) = &mut asst.role {
            info.tokens.input = 42;
        }
        store.upsert_message(&asst).unwrap();
        let back = store.get_message(&asst.id).unwrap();
        assert_eq!(back.as_assistant().unwrap().tokens.input, 42);
    }
}
