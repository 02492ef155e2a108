// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! One-shot import of the legacy JSON storage tree.
//!
//! Earlier releases persisted every entity as a JSON file under
//! `<data>/storage/`:
//!
//! ```text
//! storage/project/<project>.json
//! storage/session/<project>/<session>.json
//! storage/message/<session>/<message>.json
//! storage/part/<message>/<part>.json
//! storage/session_diff/<session>.json
//! storage/todo/<session>.json
//! storage/permission/<project>.json
//! storage/share/<session>.json
//! ```
//!
//! On first open the whole tree is folded into SQLite inside a single
//! transaction: rows are inserted with conflict-ignore, rows whose parent
//! is missing are skipped with a warning, and the `sqlite-migrated` marker
//! file is written only after the transaction commits.  A crash anywhere
//! before the marker leaves the tree untouched and the import re-runs
//! cleanly on the next open.
use std::path::{Path, PathBuf};

use rusqlite::{params, Transaction};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use nils_session::{Message, Part, Project, Ruleset, Session, SessionDiff, ShareInfo, TodoItem};

use crate::db::{Store, StoreError};

/// Marker file inside `<data>/storage/`; its presence blocks re-import.
pub const IMPORT_MARKER: &str = "sqlite-migrated";

#[derive(Default)]
struct ImportStats {
    imported: usize,
    skipped: usize,
}

/// Import the legacy tree under `data_dir` if present and not yet imported.
pub fn import_legacy(store: &Store, data_dir: &Path) -> Result<(), StoreError> {
    let root = data_dir.join("storage");
    if !root.is_dir() {
        return Ok(());
    }
    if root.join(IMPORT_MARKER).exists() {
        return Ok(());
    }

    info!(root = %root.display(), "importing legacy JSON storage");
    let mut stats = ImportStats::default();
    store.with_tx(|tx| {
        import_projects(tx, &root.join("project"), &mut stats)?;
        import_sessions(tx, &root.join("session"), &mut stats)?;
        import_messages(tx, &root.join("message"), &mut stats)?;
        import_parts(tx, &root.join("part"), &mut stats)?;
        import_keyed::<SessionDiff>(
            tx,
            &root.join("session_diff"),
            "session",
            "INSERT OR IGNORE INTO session_diff (session_id, data_json) VALUES (?1, ?2)",
            &mut stats,
        )?;
        import_keyed::<Vec<TodoItem>>(
            tx,
            &root.join("todo"),
            "session",
            "INSERT OR IGNORE INTO todo (session_id, data_json) VALUES (?1, ?2)",
            &mut stats,
        )?;
        import_keyed::<Ruleset>(
            tx,
            &root.join("permission"),
            "project",
            "INSERT OR IGNORE INTO permission (project_id, data_json) VALUES (?1, ?2)",
            &mut stats,
        )?;
        // Downloaded shares carry no FK; import unconditionally.
        for (stem, share) in read_dir_json::<ShareInfo>(&root.join("share")) {
            tx.execute(
                "INSERT OR IGNORE INTO share (session_id, data_json) VALUES (?1, ?2)",
                params![stem, serde_json::to_string(&share)?],
            )?;
            stats.imported += 1;
        }
        Ok(())
    })?;

    // Written last: a crash before this line re-runs the (idempotent)
    // import; a crash after it never does.
    std::fs::write(
        root.join(IMPORT_MARKER),
        chrono::Utc::now().to_rfc3339(),
    )?;
    info!(
        imported = stats.imported,
        skipped = stats.skipped,
        "legacy import finished"
    );
    Ok(())
}

fn import_projects(
    tx: &Transaction<'_>,
    dir: &Path,
    stats: &mut ImportStats,
) -> Result<(), StoreError> {
    for (_, project) in read_dir_json::<Project>(dir) {
        crate::repo::tx_upsert_project(tx, &project)?;
        stats.imported += 1;
    }
    Ok(())
}

fn import_sessions(
    tx: &Transaction<'_>,
    dir: &Path,
    stats: &mut ImportStats,
) -> Result<(), StoreError> {
    for (_, session) in read_nested_json::<Session>(dir) {
        if !row_exists(tx, "project", &session.project_id)? {
            warn!(
                session = %session.id,
                project = %session.project_id,
                "skipping orphaned session"
            );
            stats.skipped += 1;
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO session (id, project_id, parent_id, created_at, updated_at, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.project_id,
                session.parent_id,
                session.time.created.to_rfc3339(),
                session.time.updated.to_rfc3339(),
                serde_json::to_string(&session)?,
            ],
        )?;
        stats.imported += 1;
    }
    Ok(())
}

fn import_messages(
    tx: &Transaction<'_>,
    dir: &Path,
    stats: &mut ImportStats,
) -> Result<(), StoreError> {
    for (_, message) in read_nested_json::<Message>(dir) {
        if !row_exists(tx, "session", &message.session_id)? {
            warn!(
                message = %message.id,
                session = %message.session_id,
                "skipping orphaned message"
            );
            stats.skipped += 1;
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO message (id, session_id, created_at, data_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message.id,
                message.session_id,
                message.time.created.to_rfc3339(),
                serde_json::to_string(&message)?,
            ],
        )?;
        stats.imported += 1;
    }
    Ok(())
}

fn import_parts(
    tx: &Transaction<'_>,
    dir: &Path,
    stats: &mut ImportStats,
) -> Result<(), StoreError> {
    for (_, part) in read_nested_json::<Part>(dir) {
        if !row_exists(tx, "message", &part.message_id)? {
            warn!(
                part = %part.id,
                message = %part.message_id,
                "skipping orphaned part"
            );
            stats.skipped += 1;
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO part (id, message_id, session_id, data_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                part.id,
                part.message_id,
                part.session_id,
                serde_json::to_string(&part)?,
            ],
        )?;
        stats.imported += 1;
    }
    Ok(())
}

/// Import `<dir>/<key>.json` files into a keyed single-blob table after
/// checking that the referenced parent row exists.
fn import_keyed<T: DeserializeOwned + serde::Serialize>(
    tx: &Transaction<'_>,
    dir: &Path,
    parent_table: &str,
    insert_sql: &str,
    stats: &mut ImportStats,
) -> Result<(), StoreError> {
    for (stem, value) in read_dir_json::<T>(dir) {
        if !row_exists(tx, parent_table, &stem)? {
            warn!(key = %stem, table = parent_table, "skipping orphaned row");
            stats.skipped += 1;
            continue;
        }
        tx.execute(insert_sql, params![stem, serde_json::to_string(&value)?])?;
        stats.imported += 1;
    }
    Ok(())
}

fn row_exists(tx: &Transaction<'_>, table: &str, id: &str) -> Result<bool, StoreError> {
    // Table names come from the fixed call sites above, never from input.
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
    let sql = match table {
        "project" | "session" | "message" => sql,
        _ => return Ok(false),
    };
    let found = tx
        .query_row(&sql, [id], |_| Ok(()))
        .map(|_| true)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(false),
            other => Err(other),
        })?;
    Ok(found)
}

/// Parse every `*.json` directly inside `dir`, sorted by file name.
/// Returns `(file stem, value)` pairs; unparsable files are skipped with a
/// warning.
fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Vec<(String, T)> {
    let mut files = json_files(dir, 1);
    files.sort();
    parse_files(files)
}

/// Parse every `*.json` one directory level down (`dir/<parent>/<id>.json`).
fn read_nested_json<T: DeserializeOwned>(dir: &Path) -> Vec<(String, T)> {
    let mut files = json_files(dir, 2);
    files.sort();
    parse_files(files)
}

fn json_files(dir: &Path, depth: usize) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .collect()
}

fn parse_files<T: DeserializeOwned>(files: Vec<PathBuf>) -> Vec<(String, T)> {
    let mut out = Vec::new();
    for path in files {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), "unreadable legacy file: {e}");
                continue;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => out.push((stem, value)),
            Err(e) => {
                warn!(path = %path.display(), "unparsable legacy file: {e}");
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_session::{ModelRef, UserInfo};

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(value).unwrap()).unwrap();
    }

    fn seed_legacy_tree(data_dir: &Path) -> (Project, Session, Message, Part) {
        let storage = data_dir.join("storage");
        let project = Project::new("prj_legacy", "/w");
        let session = Session::new(&project.id, "/w");
        let message = Message::user(
            &session.id,
            UserInfo {
                agent: "build".into(),
                model: ModelRef {
                    provider_id: "mock".into(),
                    model_id: "mock-model".into(),
                },
                attachments: vec![],
            },
        );
        let part = Part::text(&session.id, &message.id, "hi");

        write_json(
            &storage.join("project").join(format!("{}.json", project.id)),
            &project,
        );
        write_json(
            &storage
                .join("session")
                .join(&project.id)
                .join(format!("{}.json", session.id)),
            &session,
        );
        write_json(
            &storage
                .join("message")
                .join(&session.id)
                .join(format!("{}.json", message.id)),
            &message,
        );
        write_json(
            &storage
                .join("part")
                .join(&message.id)
                .join(format!("{}.json", part.id)),
            &part,
        );
        (project, session, message, part)
    }

    #[test]
    fn imports_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (project, session, message, part) = seed_legacy_tree(dir.path());

        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_project(&project.id).unwrap().id, project.id);
        assert_eq!(store.get_session(&session.id).unwrap().id, session.id);
        assert_eq!(store.list_messages(&session.id).unwrap()[0].id, message.id);
        assert_eq!(store.list_parts(&message.id).unwrap()[0].id, part.id);
        assert!(dir.path().join("storage").join(IMPORT_MARKER).exists());
    }

    #[test]
    fn second_import_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (_, session, _, _) = seed_legacy_tree(dir.path());

        {
            Store::open(dir.path()).unwrap();
        }
        // Add another legacy file after the first import; the marker must
        // block it from ever being read.
        let extra = Session::new("prj_legacy", "/w");
        write_json(
            &dir.path()
                .join("storage/session/prj_legacy")
                .join(format!("{}.json", extra.id)),
            &extra,
        );
        let store = Store::open(dir.path()).unwrap();
        let sessions = store.list_sessions("prj_legacy").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session.id);
    }

    #[test]
    fn orphaned_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        // Session pointing at a project that was never written.
        let orphan = Session::new("prj_ghost", "/w");
        write_json(
            &storage
                .join("session")
                .join("prj_ghost")
                .join(format!("{}.json", orphan.id)),
            &orphan,
        );
        let store = Store::open(dir.path()).unwrap();
        assert!(store.list_sessions("prj_ghost").unwrap().is_empty());
        // The marker is still written: the import completed.
        assert!(storage.join(IMPORT_MARKER).exists());
    }

    #[test]
    fn unparsable_files_do_not_abort_import() {
        let dir = tempfile::tempdir().unwrap();
        let (project, _, _, _) = seed_legacy_tree(dir.path());
        std::fs::write(
            dir.path().join("storage/project/broken.json"),
            "{not json",
        )
        .unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_project(&project.id).unwrap().id, project.id);
    }

    #[test]
    fn no_storage_tree_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        Store::open(dir.path()).unwrap();
        assert!(!dir.path().join("storage").exists());
    }
}
