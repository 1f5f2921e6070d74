//! Active sessions and a bounded post-mortem cache (§4.13). Mirrors
//! `IdTranslator`'s sweep-on-access pattern: entries carry their own expiry
//! and get swept opportunistically rather than by a dedicated background
//! task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

const DEFAULT_TERMINATED_TTL: Duration = Duration::from_secs(60);

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminated,
}

/// Bookkeeping attached to a session for activity accounting (§4.13's
/// "mutates `metadata.lastActivityAt`/`activityCount` when present").
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub last_activity_at: Option<Instant>,
    pub activity_count: Option<u64>,
}

/// One active session: debugger-style breakpoints and console output are
/// opaque to the proxy (named directly from §4.13's terminate-snapshot
/// requirement) and carried as JSON so callers can shape them freely.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub breakpoints: HashMap<String, Value>,
    pub console_output: Vec<Value>,
    pub metadata: Option<SessionMetadata>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Active,
            breakpoints: HashMap::new(),
            console_output: Vec::new(),
            metadata: None,
        }
    }

    /// Records one unit of activity: bumps `activity_count` and refreshes
    /// `last_activity_at` when metadata is present; a no-op otherwise.
    pub fn record_activity(&mut self) {
        if let Some(metadata) = &mut self.metadata {
            metadata.last_activity_at = Some(Instant::now());
            metadata.activity_count = Some(metadata.activity_count.unwrap_or(0) + 1);
        }
    }
}

struct TerminatedEntry {
    session: Session,
    expires_at: Instant,
}

/// Active sessions, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    active: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        self.active.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.active.get(id).map(|s| s.value().clone())
    }

    pub fn record_activity(&self, id: &str) {
        if let Some(mut session) = self.active.get_mut(id) {
            session.record_activity();
        }
    }

    /// Removes a session from the active set, snapshotting it into the
    /// returned `Session` with `state` set to `Terminated` and its cleanup
    /// handle cleared (there is none to clear here; the snapshot carries
    /// only data, not behavior). Returns `None` if the id wasn't active.
    pub fn terminate(&self, id: &str) -> Option<Session> {
        let (_, mut session) = self.active.remove(id)?;
        session.state = SessionState::Terminated;
        Some(session)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Bounded cache of recently terminated sessions, each expiring after a
/// configurable TTL (default 60s).
pub struct TerminatedSessionCache {
    entries: DashMap<String, TerminatedEntry>,
    ttl: Duration,
}

impl TerminatedSessionCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TERMINATED_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Stores a terminated session snapshot with this cache's TTL, sweeping
    /// expired entries first.
    pub fn store(&self, session: Session) {
        self.sweep();
        self.entries.insert(
            session.id.clone(),
            TerminatedEntry {
                session,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Returns the snapshot if present and unexpired; an expired entry is
    /// removed as part of the lookup.
    pub fn get(&self, id: &str) -> Option<Session> {
        let now = Instant::now();
        match self.entries.get(id) {
            Some(entry) if now < entry.expires_at => Some(entry.session.clone()),
            Some(_) => {
                drop(self.entries.remove(id));
                None
            }
            None => None,
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
    }

    /// Drops every entry unconditionally, expired or not.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TerminatedSessionCache {
    fn default() -> Self {
        Self::new()
    }
}
