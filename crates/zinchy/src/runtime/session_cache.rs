//! Known-session cache shared by every connection.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::RuntimeSession;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct CacheState {
    keys: HashSet<String>,
    last_refreshed: Option<Instant>,
}

/// Set of session keys known to exist on the runtime.
///
/// Refreshes only ever grow the set; keys added locally survive a refresh that
/// does not list them.
#[derive(Debug)]
pub struct SessionCache {
    state: RwLock<CacheState>,
    ttl: Duration,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn has(&self, key: &str) -> bool {
        self.state.read().keys.contains(key)
    }

    /// Merge a listing into the cache and mark it fresh.
    pub fn refresh(&self, sessions: &[RuntimeSession]) {
        let mut state = self.state.write();
        state
            .keys
            .extend(sessions.iter().map(|session| session.key.clone()));
        state.last_refreshed = Some(Instant::now());
    }

    /// Record a key without touching freshness.
    pub fn add(&self, key: impl Into<String>) {
        self.state.write().keys.insert(key.into());
    }

    pub fn is_stale(&self) -> bool {
        match self.state.read().last_refreshed {
            None => true,
            Some(at) => at.elapsed() > self.ttl,
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.keys.clear();
        state.last_refreshed = None;
    }

    pub fn len(&self) -> usize {
        self.state.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of the known keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().keys.iter().cloned().collect();
        keys.sort();
        keys
    }
}
