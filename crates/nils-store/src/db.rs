// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "nils.db";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("migration {name} failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
}

/// Forward-only migrations, applied in slice order (names are ordered too,
/// which keeps the `_migrations` table readable).  Never edit an applied
/// entry; append a new one.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_initial",
    r#"
    CREATE TABLE project (
        id               TEXT PRIMARY KEY,
        worktree         TEXT NOT NULL,
        vcs              TEXT,
        name             TEXT NOT NULL,
        icon_url         TEXT,
        icon_color       TEXT,
        time_created     TEXT NOT NULL,
        time_updated     TEXT NOT NULL,
        time_initialized TEXT,
        sandboxes_json   TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE session (
        id         TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
        parent_id  TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        data_json  TEXT NOT NULL
    );
    CREATE INDEX idx_session_project ON session(project_id);
    CREATE INDEX idx_session_parent  ON session(parent_id);

    CREATE TABLE message (
        id         TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        data_json  TEXT NOT NULL
    );
    CREATE INDEX idx_message_session ON message(session_id);

    CREATE TABLE part (
        id         TEXT PRIMARY KEY,
        message_id TEXT NOT NULL REFERENCES message(id) ON DELETE CASCADE,
        session_id TEXT NOT NULL,
        data_json  TEXT NOT NULL
    );
    CREATE INDEX idx_part_message ON part(message_id);
    CREATE INDEX idx_part_session ON part(session_id);

    CREATE TABLE session_diff (
        session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
        data_json  TEXT NOT NULL
    );

    CREATE TABLE todo (
        session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
        data_json  TEXT NOT NULL
    );

    CREATE TABLE permission (
        project_id TEXT PRIMARY KEY REFERENCES project(id) ON DELETE CASCADE,
        data_json  TEXT NOT NULL
    );

    CREATE TABLE session_share (
        session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
        data_json  TEXT NOT NULL
    );

    -- Shares downloaded from a remote; they reference sessions that may
    -- not exist locally, hence no foreign key.
    CREATE TABLE share (
        session_id TEXT PRIMARY KEY,
        data_json  TEXT NOT NULL
    );
    "#,
)];

/// Handle to the embedded database.  A single connection behind a mutex:
/// every repository call is a short synchronous critical section, and WAL
/// keeps readers unblocked by the writer.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    data_dir: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database under `data_dir`, apply
    /// pending migrations, then run the one-shot legacy JSON import.
    ///
    /// A migration failure leaves the database untouched and is fatal to
    /// the caller.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DB_FILE);
        debug!(path = %path.display(), "opening store");
        let conn = Connection::open(&path)?;
        let store = Self::init(conn, data_dir.to_path_buf())?;
        crate::import::import_legacy(&store, data_dir)?;
        Ok(store)
    }

    /// In-memory store for tests; no import, no files.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from("."))
    }

    fn init(conn: Connection, data_dir: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -65536;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
            data_dir,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name       TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
             )",
            [],
        )?;
        for (name, sql) in MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT 1 FROM _migrations WHERE name = ?1",
                    [name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if applied {
                continue;
            }
            info!(migration = %name, "applying migration");
            let tx = conn.transaction()?;
            tx.execute_batch(sql).map_err(|e| StoreError::Migration {
                name: name.to_string(),
                source: e,
            })?;
            tx.execute(
                "INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)",
                rusqlite::params![name, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside one transaction.  All writes of a turn's persistence
    /// step go through here so a failure rolls the whole tick back.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Checkpoint the WAL; called on clean shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
