// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Time-sortable identifiers.
//!
//! Every persisted entity is keyed by an id of the form
//! `<prefix>_<12 hex ms><4 hex counter><12 hex random>`.  The millisecond
//! prefix makes ids lexicographically sortable by creation time; the
//! per-process counter makes them strictly monotonic even when several ids
//! are minted within the same millisecond.  The random tail keeps ids from
//! different processes from colliding.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Entity kinds with their id prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Project,
    Session,
    Message,
    Part,
    Permission,
    ToolOutput,
    Task,
    Usage,
}

impl Kind {
    pub fn prefix(self) -> &'static str {
        match self {
            Kind::Project => "prj",
            Kind::Session => "ses",
            Kind::Message => "msg",
            Kind::Part => "prt",
            Kind::Permission => "per",
            Kind::ToolOutput => "out",
            Kind::Task => "tsk",
            Kind::Usage => "usg",
        }
    }
}

// Packed (last_ms << 16 | counter).  The counter resets on every new
// millisecond and increments within one, so the 16-hex time+counter body
// is strictly increasing per process.
static LAST: AtomicU64 = AtomicU64::new(0);

/// Mint a new id for `kind`.  Successive calls within one process return
/// strictly increasing strings for the same prefix.
pub fn ascending(kind: Kind) -> String {
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let prev_ms = prev >> 16;
        let prev_ctr = prev & 0xffff;
        let next = if now_ms > prev_ms {
            now_ms << 16
        } else {
            // Same millisecond (or clock went backwards): bump the counter
            // so ordering is preserved regardless of the wall clock.
            (prev_ms << 16) | (prev_ctr + 1)
        };
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => {
                let ms = next >> 16;
                let ctr = next & 0xffff;
                let rand = random_tail();
                return format!("{}_{:012x}{:04x}{}", kind.prefix(), ms, ctr, rand);
            }
            Err(actual) => prev = actual,
        }
    }
}

/// 12 hex chars of process-independent randomness.
fn random_tail() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut s = String::with_capacity(12);
    for b in &bytes[..6] {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Recover the creation timestamp embedded in an id.
///
/// Returns `None` when the string does not look like one of ours.  Used by
/// the tool-output spill GC to age files without a stat call.
pub fn created_at(id: &str) -> Option<DateTime<Utc>> {
    let (_, body) = id.split_once('_')?;
    if body.len() < 12 {
        return None;
    }
    let ms = u64::from_str_radix(&body[..12], 16).ok()?;
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// True when `id` carries the prefix of `kind`.
pub fn is_kind(id: &str, kind: Kind) -> bool {
    id.split_once('_')
        .map(|(p, _)| p == kind.prefix())
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_the_kind_prefix() {
        assert!(ascending(Kind::Session).starts_with("ses_"));
        assert!(ascending(Kind::Message).starts_with("msg_"));
        assert!(ascending(Kind::Part).starts_with("prt_"));
        assert!(ascending(Kind::ToolOutput).starts_with("out_"));
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let mut prev = ascending(Kind::Message);
        for _ in 0..1000 {
            let next = ascending(Kind::Message);
            assert!(next > prev, "{next} !> {prev}");
            prev = next;
        }
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(ascending(Kind::Part)));
        }
    }

    #[test]
    fn created_at_recovers_mint_time() {
        let before = Utc::now().timestamp_millis();
        let id = ascending(Kind::ToolOutput);
        let after = Utc::now().timestamp_millis();
        let ts = created_at(&id).unwrap().timestamp_millis();
        // The counter path may reuse the previous millisecond, so allow a
        // little slack below `before`.
        assert!(ts >= before - 1000 && ts <= after + 1000);
    }

    #[test]
    fn created_at_rejects_garbage() {
        assert!(created_at("not-an-id").is_none());
        assert!(created_at("ses_short").is_none());
    }

    #[test]
    fn is_kind_checks_prefix() {
        let id = ascending(Kind::Session);
        assert!(is_kind(&id, Kind::Session));
        assert!(!is_kind(&id, Kind::Message));
    }

    #[test]
    fn ids_sort_lexicographically_by_time() {
        let a = ascending(Kind::Message);
        std::thread::sleep(std::time::Duration::from_millis(3));
        let b = ascending(Kind::Message);
        assert!(a < b);
    }
}
