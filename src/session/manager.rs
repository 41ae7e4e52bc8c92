//! Per-agent session cache.
//!
//! The manager guarantees three things:
//!
//! - at most one live session object exists per key (single-flight
//!   creation; concurrent callers join the in-flight construction),
//! - turns on the same key are strictly serial while turns on different
//!   keys run concurrently (a fair per-key mutex), and
//! - the cache is bounded: strict LRU eviction at `max_sessions` plus a
//!   periodic TTL sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::error::SessionError;
use crate::llm::{LlmRuntime, LlmSession, SessionOptions};
use crate::session::key::{build_session_key, parse_session_key, SessionKeyParts};

/// Default cache capacity.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Default session idle TTL.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Tuning knobs for the session cache.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    pub session_ttl: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

/// Produces the [`SessionOptions`] used to create the session for a key.
pub type OptionsFactory =
    Arc<dyn Fn(&SessionKeyParts) -> SessionOptions + Send + Sync>;

struct ManagedSession {
    session: Arc<dyn LlmSession>,
    created_at_ms: i64,
    last_accessed_ms: AtomicI64,
    /// Fair mutex: queued waiters run in arrival order, which is exactly
    /// the per-key turn serialization contract.
    turn_lock: Mutex<()>,
}

impl ManagedSession {
    fn touch(&self) {
        self.last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

struct CacheState {
    live: HashMap<String, Arc<ManagedSession>>,
    /// In-flight creations. Waiters subscribe and retry once the sender
    /// side is dropped.
    pending: HashMap<String, watch::Sender<()>>,
}

struct Inner {
    runtime: Arc<dyn LlmRuntime>,
    options: OptionsFactory,
    config: SessionManagerConfig,
    state: Mutex<CacheState>,
}

/// LRU, TTL-bounded cache of LLM sessions with single-flight creation and
/// per-key turn serialization.
pub struct SessionManager {
    inner: Arc<Inner>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn LlmRuntime>,
        options: OptionsFactory,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                options,
                config,
                state: Mutex::new(CacheState {
                    live: HashMap::new(),
                    pending: HashMap::new(),
                }),
            }),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Start the periodic TTL sweep. Idempotent.
    pub fn start_cleanup(&self) {
        let mut guard = self.sweeper.lock().expect("sweeper lock poisoned");
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let period = inner.config.session_ttl.checked_div(6).map_or(
            Duration::from_secs(60),
            |sixth| sixth.max(Duration::from_secs(60)),
        );
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::sweep_expired(&inner).await;
            }
        }));
    }

    async fn sweep_expired(inner: &Arc<Inner>) {
        let cutoff =
            Utc::now().timestamp_millis() - inner.config.session_ttl.as_millis() as i64;
        let expired: Vec<(String, Arc<ManagedSession>)> = {
            let mut state = inner.state.lock().await;
            let keys: Vec<String> = state
                .live
                .iter()
                .filter(|(_, managed)| {
                    managed.last_accessed_ms.load(Ordering::SeqCst) < cutoff
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.live.remove(&key).map(|m| (key, m)))
                .collect()
        };
        for (key, managed) in expired {
            tracing::debug!(session_key = %key, "Closing idle session");
            close_session(managed).await;
        }
    }

    /// Resolve the session for the given parts, creating it if needed.
    pub async fn get_or_create(
        &self,
        parts: &SessionKeyParts,
    ) -> Result<Arc<dyn LlmSession>, SessionError> {
        self.resolve(parts).await.map(|managed| {
            managed.touch();
            Arc::clone(&managed.session)
        })
    }

    /// Resolve by raw key string.
    pub async fn get_or_create_by_key(
        &self,
        key: &str,
    ) -> Result<Arc<dyn LlmSession>, SessionError> {
        let parts =
            parse_session_key(key).ok_or_else(|| SessionError::InvalidKey(key.to_string()))?;
        self.get_or_create(&parts).await
    }

    async fn resolve(
        &self,
        parts: &SessionKeyParts,
    ) -> Result<Arc<ManagedSession>, SessionError> {
        let key = build_session_key(&parts.channel, &parts.chat_id, parts.thread_id.as_deref());

        loop {
            // Fast path, or join an in-flight creation.
            let waiter = {
                let mut state = self.inner.state.lock().await;
                if let Some(managed) = state.live.get(&key) {
                    managed.touch();
                    return Ok(Arc::clone(managed));
                }
                if let Some(tx) = state.pending.get(&key) {
                    Some(tx.subscribe())
                } else {
                    // Claim the creation slot; evict before we grow.
                    if state.live.len() >= self.inner.config.max_sessions {
                        evict_lru(&mut state);
                    }
                    let (tx, _rx) = watch::channel(());
                    state.pending.insert(key.clone(), tx);
                    None
                }
            };

            if let Some(mut rx) = waiter {
                // Creator finished (or failed) when the sender drops.
                let _ = rx.changed().await;
                continue;
            }

            let options = (self.inner.options)(parts);
            let created = self.inner.runtime.create_session(options).await;

            let mut state = self.inner.state.lock().await;
            state.pending.remove(&key);
            match created {
                Ok(session) => {
                    let now = Utc::now().timestamp_millis();
                    let managed = Arc::new(ManagedSession {
                        session,
                        created_at_ms: now,
                        last_accessed_ms: AtomicI64::new(now),
                        turn_lock: Mutex::new(()),
                    });
                    state.live.insert(key.clone(), Arc::clone(&managed));
                    tracing::debug!(session_key = %key, "Created session");
                    return Ok(managed);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `f` against the key's session, serialized after every
    /// previously submitted turn on the same key. Turns on other keys are
    /// unaffected. Errors from earlier turns do not poison the chain.
    pub async fn with_session<T, F, Fut>(
        &self,
        parts: &SessionKeyParts,
        f: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<dyn LlmSession>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let managed = self.resolve(parts).await?;
        let _turn = managed.turn_lock.lock().await;
        managed.touch();
        f(Arc::clone(&managed.session)).await
    }

    /// Keys of all cached sessions.
    pub async fn list_sessions(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut keys: Vec<String> = state.live.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of cached sessions.
    pub async fn active_sessions(&self) -> usize {
        self.inner.state.lock().await.live.len()
    }

    /// Creation time of a cached session, for diagnostics.
    pub async fn session_age_ms(&self, key: &str) -> Option<i64> {
        let state = self.inner.state.lock().await;
        state
            .live
            .get(key)
            .map(|m| Utc::now().timestamp_millis() - m.created_at_ms)
    }

    /// Stop the sweeper and close every cached session.
    pub async fn close(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }
        let drained: Vec<Arc<ManagedSession>> = {
            let mut state = self.inner.state.lock().await;
            state.live.drain().map(|(_, managed)| managed).collect()
        };
        for managed in drained {
            close_session(managed).await;
        }
    }
}

/// Pick the least-recently-accessed entry and schedule its close.
///
/// The close runs in the background; the caller installs its new session
/// without waiting for the evicted one to finish closing.
fn evict_lru(state: &mut CacheState) {
    let victim_key = state
        .live
        .iter()
        .min_by_key(|(_, managed)| managed.last_accessed_ms.load(Ordering::SeqCst))
        .map(|(key, _)| key.clone());
    if let Some(key) = victim_key {
        if let Some(managed) = state.live.remove(&key) {
            tracing::debug!(session_key = %key, "Evicting LRU session");
            tokio::spawn(close_session_owned(managed));
        }
    }
}

async fn close_session(managed: Arc<ManagedSession>) {
    // Drain the turn chain before closing the façade.
    let _turn = managed.turn_lock.lock().await;
    if let Err(e) = managed.session.close().await {
        tracing::warn!("Session close failed: {}", e);
    }
}

async fn close_session_owned(managed: Arc<ManagedSession>) {
    close_session(managed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedRuntime;

    fn manager_with(
        runtime: &ScriptedRuntime,
        config: SessionManagerConfig,
    ) -> SessionManager {
        let options: OptionsFactory =
            Arc::new(|_parts| SessionOptions::new("test-model"));
        SessionManager::new(Arc::new(runtime.clone()), options, config)
    }

    fn parts(chat_id: &str) -> SessionKeyParts {
        SessionKeyParts::new("cli", chat_id)
    }

    #[tokio::test]
    async fn test_single_flight_creation() {
        let runtime = ScriptedRuntime::new();
        runtime.set_create_delay(Duration::from_millis(50));
        let manager = Arc::new(manager_with(&runtime, SessionManagerConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.get_or_create(&parts("same")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(runtime.created_sessions(), 1);
        assert_eq!(manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_failed_create_is_not_cached() {
        let runtime = ScriptedRuntime::new();
        runtime.fail_next_create();
        let manager = manager_with(&runtime, SessionManagerConfig::default());

        assert!(manager.get_or_create(&parts("a")).await.is_err());
        assert_eq!(manager.active_sessions().await, 0);

        // The next call succeeds and creates a fresh session.
        manager.get_or_create(&parts("a")).await.unwrap();
        assert_eq!(runtime.created_sessions(), 1);
    }

    #[tokio::test]
    async fn test_same_key_turns_are_serial() {
        let runtime = ScriptedRuntime::new();
        let manager = Arc::new(manager_with(&runtime, SessionManagerConfig::default()));
        let running = Arc::new(AtomicI64::new(0));
        let overlapped = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let overlapped = Arc::clone(&overlapped);
            handles.push(tokio::spawn(async move {
                manager
                    .with_session(&parts("serial"), |session| async move {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        session.prompt(&format!("turn {}", i)).await?;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        let sessions = runtime.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].prompts().len(), 6);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let runtime = ScriptedRuntime::new();
        let manager = Arc::new(manager_with(&runtime, SessionManagerConfig::default()));
        let peak = Arc::new(AtomicI64::new(0));
        let current = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let manager = Arc::clone(&manager);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                manager
                    .with_session(&parts(&format!("chat-{}", i)), |_session| async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_turn_error_does_not_poison_the_chain() {
        let runtime = ScriptedRuntime::new();
        let manager = manager_with(&runtime, SessionManagerConfig::default());

        let failed: Result<(), SessionError> = manager
            .with_session(&parts("chain"), |_session| async move {
                Err(SessionError::Closed)
            })
            .await;
        assert!(failed.is_err());

        // The next turn on the same key still runs.
        manager
            .with_session(&parts("chain"), |session| async move {
                session.prompt("still alive").await?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let runtime = ScriptedRuntime::new();
        let manager = manager_with(
            &runtime,
            SessionManagerConfig {
                max_sessions: 3,
                session_ttl: DEFAULT_SESSION_TTL,
            },
        );

        for name in ["a", "b", "c"] {
            manager.get_or_create(&parts(name)).await.unwrap();
            // Distinct access times so the LRU order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Refresh "a"; "b" becomes the LRU victim.
        manager.get_or_create(&parts("a")).await.unwrap();
        manager.get_or_create(&parts("d")).await.unwrap();

        let keys = manager.list_sessions().await;
        assert_eq!(keys, vec!["cli:a", "cli:c", "cli:d"]);

        // The evicted session gets closed in the background.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let closed: Vec<bool> = runtime.sessions().iter().map(|s| s.is_closed()).collect();
        assert_eq!(closed.iter().filter(|c| **c).count(), 1);
    }

    #[tokio::test]
    async fn test_close_closes_every_session() {
        let runtime = ScriptedRuntime::new();
        let manager = manager_with(&runtime, SessionManagerConfig::default());

        manager.get_or_create(&parts("x")).await.unwrap();
        manager.get_or_create(&parts("y")).await.unwrap();
        manager.close().await;

        assert_eq!(manager.active_sessions().await, 0);
        assert!(runtime.sessions().iter().all(|s| s.is_closed()));
    }
}
