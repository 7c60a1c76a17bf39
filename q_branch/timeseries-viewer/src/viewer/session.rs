//! Session table.
//!
//! One [`ViewportController`] per session token, each behind its own async
//! mutex so events of a session are applied one at a time while different
//! sessions proceed in parallel. Idle sessions are reclaimed by
//! [`SessionStore::evict_idle`], normally driven by the background task from
//! [`SessionStore::spawn_eviction`].

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::controller::ViewportController;
use super::downsample::Downsampler;
use super::error::{Result, ViewerError};
use super::plot_state::PlotConfig;
use super::source::SeriesSource;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

pub type SharedController = Arc<Mutex<ViewportController>>;

struct SessionEntry {
    controller: SharedController,
    last_seen: Instant,
}

/// Live sessions keyed by token.
pub struct SessionStore {
    sessions: RwLock<FxHashMap<SessionToken, SessionEntry>>,
    source: Arc<dyn SeriesSource>,
    downsampler: Arc<Downsampler>,
    plot_config: PlotConfig,
}

impl SessionStore {
    pub fn new(
        source: Arc<dyn SeriesSource>,
        downsampler: Downsampler,
        plot_config: PlotConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            source,
            downsampler: Arc::new(downsampler),
            plot_config,
        }
    }

    fn new_entry(&self) -> SessionEntry {
        SessionEntry {
            controller: Arc::new(Mutex::new(ViewportController::new(
                self.source.clone(),
                self.downsampler.clone(),
                self.plot_config,
            ))),
            last_seen: Instant::now(),
        }
    }

    /// Issue a fresh token with an idle controller.
    pub fn create(&self) -> SessionToken {
        let token = SessionToken::new();
        let entry = self.new_entry();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(token, entry);
        info!(session = %token, total_sessions = sessions.len(), "Session created");
        token
    }

    /// Controller of `token`, creating an idle one for unknown tokens.
    pub fn get_or_create(&self, token: SessionToken) -> SharedController {
        if let Some(entry) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
        {
            return entry.controller.clone();
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.entry(token).or_insert_with(|| {
            debug!(session = %token, "Creating session state");
            self.new_entry()
        });
        entry.controller.clone()
    }

    /// Controller of an existing session.
    pub fn get(&self, token: SessionToken) -> Result<SharedController> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .map(|entry| entry.controller.clone())
            .ok_or_else(|| ViewerError::SessionExpired(token.to_string()))
    }

    /// Mark a session as active. Returns false for unknown tokens.
    pub fn touch(&self, token: SessionToken) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(&token) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// End a session explicitly.
    pub fn remove(&self, token: SessionToken) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let removed = sessions.remove(&token).is_some();
        if removed {
            info!(session = %token, total_sessions = sessions.len(), "Session ended");
        }
        removed
    }

    /// Drop sessions not touched for at least `older_than`. Sessions with an
    /// event in flight are kept. Returns the number evicted.
    pub fn evict_idle(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.last_seen) >= older_than;
            !idle || Arc::strong_count(&entry.controller) > 1
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, token: SessionToken) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&token)
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval`.
    pub fn spawn_eviction(self: &Arc<Self>, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                store.evict_idle(idle_timeout);
            }
        })
    }
}
