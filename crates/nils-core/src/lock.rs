// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use nils_session::NamedError;

/// Per-session mutual exclusion: at most one active turn per session.
/// Turns on different sessions run concurrently.
#[derive(Default)]
pub struct SessionLocks {
    held: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock for `session_id`.  Fails with `Busy` when a turn is
    /// already running.  The returned guard releases on drop, on every
    /// exit path.
    pub fn acquire(self: &Arc<Self>, session_id: &str) -> Result<SessionGuard, NamedError> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(session_id) {
            return Err(NamedError::busy(session_id));
        }
        let token = CancellationToken::new();
        held.insert(session_id.to_string(), token.clone());
        Ok(SessionGuard {
            locks: Arc::clone(self),
            session_id: session_id.to_string(),
            token,
        })
    }

    pub fn assert_unlocked(&self, session_id: &str) -> Result<(), NamedError> {
        if self.held.lock().unwrap().contains_key(session_id) {
            return Err(NamedError::busy(session_id));
        }
        Ok(())
    }

    pub fn is_locked(&self, session_id: &str) -> bool {
        self.held.lock().unwrap().contains_key(session_id)
    }

    /// Fire the held token's signal.  The turn loop observes it at the
    /// next suspension point and unwinds.  Returns false when no turn is
    /// running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.held.lock().unwrap().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight turn; used by shutdown and dispose.
    pub fn cancel_all(&self) {
        for token in self.held.lock().unwrap().values() {
            token.cancel();
        }
    }
}

/// Scoped lock token.  Exposes the turn's cancellation signal; dropping it
/// releases the session.
pub struct SessionGuard {
    locks: Arc<SessionLocks>,
    session_id: String,
    token: CancellationToken,
}

impl SessionGuard {
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
