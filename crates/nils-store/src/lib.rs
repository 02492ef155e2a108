// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! SQLite-backed persistence.
//!
//! One database per data directory (`<data>/nils.db`), WAL mode, forward-only
//! name-ordered migrations, and a one-shot import of the legacy JSON storage
//! tree on first open.  All entity payloads are JSON blobs in `data_json`
//! columns; the relational skeleton carries ids, foreign keys, and ordering.
mod db;
mod import;
mod repo;

pub use db::{Store, StoreError, DB_FILE};
pub use import::{import_legacy, IMPORT_MARKER};
