//! Live session table.
//!
//! Sessions are keyed by the server-issued session id. The registry is
//! pure bookkeeping; attaching and detaching over the wire happens in
//! the client layer.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TargetId};

// ============================================================================
// Constants
// ============================================================================

/// Age past which a session counts against the health score.
const STALE_SESSION_AGE: Duration = Duration::from_secs(30 * 60);

/// Session count past which the registry counts as crowded.
const CROWDED_SESSION_COUNT: usize = 20;

// ============================================================================
// SessionRecord
// ============================================================================

/// Bookkeeping for one live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Server-issued session id.
    pub id: SessionId,

    /// Target the session is attached to.
    pub target_id: TargetId,

    /// When the session was registered.
    pub created_at: Instant,
}

impl SessionRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(id: SessionId, target_id: TargetId) -> Self {
        Self {
            id,
            target_id,
            created_at: Instant::now(),
        }
    }

    /// Time since registration.
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

// ============================================================================
// RegistryHealth
// ============================================================================

/// Health assessment of the session table.
#[derive(Debug, Clone)]
pub struct RegistryHealth {
    /// 0 to 100; 100 is clean.
    pub score: u8,

    /// Human-readable degradation reasons; empty when clean.
    pub reasons: Vec<String>,
}

impl RegistryHealth {
    /// Returns `true` when nothing degrades the score.
    #[inline]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.reasons.is_empty()
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Table of live sessions.
///
/// # Thread Safety
///
/// `SessionRegistry` is `Send + Sync`; reads take a shared lock, writes
/// an exclusive one.
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<SessionId, SessionRecord>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers a session. Re-registering an id replaces the record.
    pub fn register(&self, record: SessionRecord) {
        info!(session_id = %record.id, target_id = %record.target_id, "session registered");
        self.sessions.write().insert(record.id.clone(), record);
    }

    /// Removes a session.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] if the id is not registered.
    pub fn remove(&self, session_id: &SessionId) -> Result<SessionRecord> {
        match self.sessions.write().remove(session_id) {
            Some(record) => {
                debug!(session_id = %session_id, "session removed");
                Ok(record)
            }
            None => Err(Error::session_not_found(session_id.clone())),
        }
    }

    /// Removes every session, returning the removed ids.
    pub fn clear(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        let ids: Vec<SessionId> = sessions.keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "all sessions torn down");
        }
        sessions.clear();
        ids
    }

    /// Looks up a session record.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Returns `true` if the id is registered.
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Returns every registered id.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Returns the most recently created session.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveSession`] when the registry is empty.
    pub fn default_session(&self) -> Result<SessionRecord> {
        self.sessions
            .read()
            .values()
            .max_by_key(|record| record.created_at)
            .cloned()
            .ok_or(Error::NoActiveSession)
    }

    /// Scores the session table from 0 (degraded) to 100 (clean).
    ///
    /// Stale sessions and a crowded table each lower the score; the
    /// reasons name what to fix.
    #[must_use]
    pub fn assess_health(&self) -> RegistryHealth {
        let sessions = self.sessions.read();

        let mut score: i32 = 100;
        let mut reasons = Vec::new();

        let stale = sessions
            .values()
            .filter(|record| record.age() > STALE_SESSION_AGE)
            .count();
        if stale > 0 {
            score -= (stale as i32) * 10;
            reasons.push(format!(
                "{stale} session(s) older than {} minutes",
                STALE_SESSION_AGE.as_secs() / 60
            ));
        }

        if sessions.len() > CROWDED_SESSION_COUNT {
            score -= 20;
            reasons.push(format!(
                "{} live sessions (threshold {CROWDED_SESSION_COUNT})",
                sessions.len()
            ));
        }

        RegistryHealth {
            score: score.clamp(0, 100) as u8,
            reasons,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
