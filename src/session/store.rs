//! Registry of live voice sessions
//!
//! Sessions are keyed by their generated id and never share state with each
//! other; the store only tracks liveness so idle connections can be reaped
//! and new ones refused at capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Public view of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    info: SessionInfo,
    /// Milliseconds since the store's epoch
    last_activity: AtomicU64,
    shutdown: CancellationToken,
}

/// Shared, cloneable handle to the live sessions
///
/// Activity is recorded per entry under the read lock, so frames arriving on
/// many connections never queue behind each other.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    epoch: Instant,
    max_sessions: usize,
}

impl SessionStore {
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
            max_sessions,
        }
    }

    fn clock_ms(&self) -> u64 {
        millis(self.epoch.elapsed())
    }

    /// Register a session and return the token that shuts it down
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionCapacity`] when the store is full
    pub async fn insert(&self, session_id: &str, user_id: &str) -> Result<CancellationToken> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(Error::SessionCapacity(sessions.len()));
        }

        let shutdown = CancellationToken::new();
        sessions.insert(
            session_id.to_string(),
            Entry {
                info: SessionInfo {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    connected_at: Utc::now(),
                },
                last_activity: AtomicU64::new(self.clock_ms()),
                shutdown: shutdown.clone(),
            },
        );

        tracing::info!(session_id, user_id, active = sessions.len(), "session registered");
        Ok(shutdown)
    }

    /// Record inbound activity
    pub async fn touch(&self, session_id: &str) {
        let now = self.clock_ms();
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            entry.last_activity.fetch_max(now, Ordering::Relaxed);
        }
    }

    /// Drop a session from the registry
    pub async fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id, "session removed");
        }
        removed.map(|e| e.info)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Snapshot of live sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by_key(|i| i.connected_at);
        infos
    }

    /// Shut down sessions idle for longer than `idle`
    ///
    /// Returns the ids of the sessions that were signalled. They stay in the
    /// store until their connection handler removes them.
    pub async fn reap_idle(&self, idle: Duration) -> Vec<String> {
        let now = self.clock_ms();
        let idle = millis(idle);
        let sessions = self.sessions.read().await;
        let mut reaped = Vec::new();
        for (id, entry) in sessions.iter() {
            let quiet = now.saturating_sub(entry.last_activity.load(Ordering::Relaxed));
            if quiet >= idle && !entry.shutdown.is_cancelled() {
                tracing::info!(session_id = %id, "reaping idle session");
                entry.shutdown.cancel();
                reaped.push(id.clone());
            }
        }
        reaped
    }

    /// Periodically reap idle sessions until `shutdown` fires
    pub fn spawn_reaper(
        &self,
        idle: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let period = (idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        store.reap_idle(idle).await;
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Signal every live session to shut down
    pub async fn cancel_all(&self) {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.shutdown.cancel();
        }
        tracing::info!(count = sessions.len(), "signalled all sessions");
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_sessions_beyond_capacity() {
        let store = SessionStore::new(1);
        store.insert("a", "u").await.unwrap();
        let err = store.insert("b", "u").await.unwrap_err();
        assert!(matches!(err, Error::SessionCapacity(1)));

        store.remove("a").await;
        assert!(store.insert("b", "u").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reaps_only_idle_sessions() {
        let store = SessionStore::new(8);
        let stale = store.insert("stale", "u").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let fresh = store.insert("fresh", "u").await.unwrap();

        let reaped = store.reap_idle(Duration::from_secs(20)).await;
        assert_eq!(reaped, vec!["stale".to_string()]);
        assert!(stale.is_cancelled());
        assert!(!fresh.is_cancelled());

        // already signalled sessions are not reported twice
        assert!(store.reap_idle(Duration::from_secs(20)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_clock() {
        let store = SessionStore::new(8);
        let token = store.insert("s", "u").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.touch("s").await;

        assert!(store.reap_idle(Duration::from_secs(20)).await.is_empty());
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_proceeds_while_sessions_are_being_read() {
        let store = SessionStore::new(8);
        store.insert("s", "u").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let reader = store.sessions.read().await;
        tokio::time::timeout(Duration::from_millis(10), store.touch("s"))
            .await
            .expect("touch waited for a reader");
        drop(reader);

        assert!(store.reap_idle(Duration::from_secs(20)).await.is_empty());
    }

    #[tokio::test]
    async fn list_reports_user_ids() {
        let store = SessionStore::new(8);
        store.insert("s1", "alice").await.unwrap();
        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].user_id, "alice");
        assert_eq!(store.len().await, 1);
    }
}
