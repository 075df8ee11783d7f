//! Session registry: who is connected and what they are looking at.
//!
//! A session moves through a small lifecycle:
//!
//! ```text
//! Unknown ──add_session──► Active ──remove_session──► Removed
//!                          │    ▲
//!                          └────┘ update_presence
//! ```
//!
//! Missing sessions are never an error. `update_presence` and
//! `remove_session` on an unknown id are silent no-ops.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::merge::StateSnapshot;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Opaque session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh 256-bit token rendered as lowercase hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for SessionId {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// A connected participant and their live presence state.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub display_name: String,
    /// Raw public key bytes (Ed25519 when signing is enabled).
    pub public_key: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
    /// Opaque presence blob, replaced wholesale on every update.
    pub state: Map<String, Value>,
}

impl Session {
    fn new(id: SessionId, display_name: String, public_key: Vec<u8>) -> Self {
        Self {
            id,
            display_name,
            public_key,
            last_seen: unix_millis(),
            state: Map::new(),
        }
    }

    /// Current state as a mergeable snapshot stamped with `last_seen`.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.id.clone(), self.last_seen, self.state.clone())
    }
}

/// Where a session id sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Unknown,
    Active,
    Removed,
}

/// Upper bound on remembered removals; the oldest is evicted past this.
pub const MAX_TOMBSTONES: usize = 4096;

/// In-memory session table, owned by whoever drives the hub.
///
/// Removed ids are remembered with their removal time so `lifecycle` can
/// report [`SessionLifecycle::Removed`]. Those tombstones are dropped once
/// older than the idle limit passed to [`reap_idle`](Self::reap_idle), and
/// never exceed [`MAX_TOMBSTONES`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    removed: HashMap<SessionId, u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a session. Re-adding an id silently replaces it.
    pub fn add_session(
        &mut self,
        id: SessionId,
        display_name: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
    ) {
        self.removed.remove(&id);
        let session = Session::new(id.clone(), display_name.into(), public_key.into());
        self.sessions.insert(id, session);
    }

    /// Delete a session. Returns the record if there was one.
    pub fn remove_session(&mut self, id: &SessionId) -> Option<Session> {
        self.remove_at(id, unix_millis())
    }

    fn remove_at(&mut self, id: &SessionId, now_ms: u64) -> Option<Session> {
        let removed = self.sessions.remove(id)?;
        self.removed.insert(id.clone(), now_ms);

        if self.removed.len() > MAX_TOMBSTONES {
            let oldest = self
                .removed
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.removed.remove(&oldest);
            }
        }
        Some(removed)
    }

    /// Refresh `last_seen` and replace the state blob.
    ///
    /// Returns `false` if the session is not registered.
    pub fn update_presence(&mut self, id: &SessionId, state: Map<String, Value>) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_seen = unix_millis();
                session.state = state;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn lifecycle(&self, id: &SessionId) -> SessionLifecycle {
        if self.sessions.contains_key(id) {
            SessionLifecycle::Active
        } else if self.removed.contains_key(id) {
            SessionLifecycle::Removed
        } else {
            SessionLifecycle::Unknown
        }
    }

    /// Number of remembered removals.
    pub fn tombstone_count(&self) -> usize {
        self.removed.len()
    }

    /// Remove sessions not seen for longer than `max_idle`, and forget
    /// removals older than that.
    pub fn reap_idle(&mut self, max_idle: Duration) -> Vec<SessionId> {
        self.reap_idle_at(max_idle, unix_millis())
    }

    /// Same as [`reap_idle`](Self::reap_idle) against an explicit clock.
    pub fn reap_idle_at(&mut self, max_idle: Duration, now_ms: u64) -> Vec<SessionId> {
        let limit = max_idle.as_millis() as u64;
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| now_ms.saturating_sub(s.last_seen) > limit)
            .map(|s| s.id.clone())
            .collect();

        self.removed.retain(|_, at| now_ms.saturating_sub(*at) <= limit);
        for id in &stale {
            self.remove_at(id, now_ms);
        }

        stale
    }
}
