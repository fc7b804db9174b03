//! Session Registry
//!
//! In-memory sessions keyed by (user, context). Lookups for the same key hand
//! out the same `Arc<Session>`; a background sweeper evicts sessions that have
//! been idle longer than the configured timeout.
//!
//! Nothing here is persisted. A restart forgets every session.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::bridge::ExecutionResult;
use crate::config::ContextTable;

/// How often the sweeper runs
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Delay before the first sweep
pub const SWEEP_GRACE: Duration = Duration::from_secs(60);

/// Session identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: i64,
    pub context: String,
}

impl SessionKey {
    pub fn new(user_id: i64, context: impl Into<String>) -> Self {
        Self {
            user_id,
            context: context.into(),
        }
    }

    /// `"<user>_<context>"`
    pub fn id(&self) -> String {
        format!("{}_{}", self.user_id, self.context)
    }
}

/// One recorded interaction
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub prompt: String,
    pub result: ExecutionResult,
}

#[derive(Debug)]
struct SessionState {
    last_activity: DateTime<Utc>,
    history: VecDeque<HistoryEntry>,
    interactions: u64,
}

/// A user's working session in one context
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    history_limit: usize,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(key: SessionKey, working_dir: PathBuf, history_limit: usize) -> Self {
        let now = Utc::now();
        Self {
            key,
            working_dir,
            created_at: now,
            history_limit,
            state: Mutex::new(SessionState {
                last_activity: now,
                history: VecDeque::new(),
                interactions: 0,
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().last_activity
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.state.lock().last_activity = at;
    }

    /// Append to history, dropping the oldest entry past the cap
    pub fn record(&self, prompt: &str, result: ExecutionResult) {
        let mut state = self.state.lock();
        state.interactions += 1;
        if self.history_limit == 0 {
            return;
        }
        while state.history.len() >= self.history_limit {
            state.history.pop_front();
        }
        state.history.push_back(HistoryEntry {
            prompt: prompt.to_string(),
            result,
        });
    }

    /// Oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Every interaction ever recorded, including ones dropped from history
    pub fn interactions(&self) -> u64 {
        self.state.lock().interactions
    }

    /// Seconds since last activity as of `now`
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }

    pub fn snapshot(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: self.key.id(),
            context: self.key.context.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity,
            interactions: state.interactions,
        }
    }
}

/// Point-in-time view for `/sessions`
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub context: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub interactions: u64,
}

/// Owner of all live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    contexts: ContextTable,
    history_limit: usize,
}

impl SessionRegistry {
    pub fn new(contexts: ContextTable, history_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            contexts,
            history_limit,
        }
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    /// Existing session for `key`, or a fresh one bound to the context's directory
    pub fn get_or_create(&self, key: &SessionKey) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(key) {
            return Arc::clone(session);
        }

        let mut sessions = self.sessions.write();
        // Another task may have inserted between the two locks
        let session = sessions.entry(key.clone()).or_insert_with(|| {
            let dir = self.contexts.resolve(&key.context).to_path_buf();
            info!("Created session {} in {:?}", key.id(), dir);
            Arc::new(Session::new(key.clone(), dir, self.history_limit))
        });
        Arc::clone(session)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.read().get(key).cloned()
    }

    /// Remove sessions idle for strictly longer than `max_age`
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        self.evict_idle_at(Utc::now(), max_age)
    }

    pub fn evict_idle_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|key, session| {
            let expired = session.idle_for(now) > max_age;
            if expired {
                debug!("Evicting idle session {}", key.id());
            }
            !expired
        });
        before - sessions.len()
    }

    /// Sessions belonging to one user, ordered by context name
    pub fn sessions_for_user(&self, user_id: i64) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.key().user_id == user_id)
            .map(|s| s.snapshot())
            .collect();
        infos.sort_by(|a, b| a.context.cmp(&b.context));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Start the periodic idle sweep (call once, from the runtime)
    pub fn spawn_sweeper(self: Arc<Self>, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(SWEEP_GRACE).await;
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = self.evict_idle(max_age);
                if removed > 0 {
                    info!("Cleaned up {} inactive sessions", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(limit: usize) -> SessionRegistry {
        SessionRegistry::new(ContextTable::new("/srv/app", "api", "web"), limit)
    }

    #[test]
    fn test_same_key_same_session() {
        let reg = registry(10);
        let key = SessionKey::new(42, "backend");
        let a = reg.get_or_create(&key);
        let b = reg.get_or_create(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert_eq!(a.working_dir(), Path::new("/srv/app/api"));
    }

    #[test]
    fn test_contexts_are_separate_sessions() {
        let reg = registry(10);
        let a = reg.get_or_create(&SessionKey::new(42, "backend"));
        let b = reg.get_or_create(&SessionKey::new(42, "frontend"));
        let c = reg.get_or_create(&SessionKey::new(7, "backend"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.sessions_for_user(42).len(), 2);
    }

    #[test]
    fn test_unknown_context_uses_root() {
        let reg = registry(10);
        let s = reg.get_or_create(&SessionKey::new(1, "mobile"));
        assert_eq!(s.working_dir(), Path::new("/srv/app"));
        assert_eq!(s.key().id(), "1_mobile");
    }

    #[test]
    fn test_eviction_boundary() {
        let reg = registry(10);
        let max_age = Duration::from_secs(3600);
        let s = reg.get_or_create(&SessionKey::new(1, "backend"));
        let t0 = Utc::now();
        s.touch_at(t0);

        let just_inside = t0 + chrono::Duration::seconds(3599);
        assert_eq!(reg.evict_idle_at(just_inside, max_age), 0);

        let exactly = t0 + chrono::Duration::seconds(3600);
        assert_eq!(reg.evict_idle_at(exactly, max_age), 0);

        let just_past = t0 + chrono::Duration::seconds(3601);
        assert_eq!(reg.evict_idle_at(just_past, max_age), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_evicted_handle_stays_usable() {
        let reg = registry(10);
        let key = SessionKey::new(1, "backend");
        let old = reg.get_or_create(&key);
        old.touch_at(Utc::now() - chrono::Duration::seconds(100));
        assert_eq!(reg.evict_idle(Duration::from_secs(10)), 1);

        old.record("still here", ExecutionResult::failure("x", Path::new("/srv/app/api")));
        let fresh = reg.get_or_create(&key);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.history_len(), 0);
    }

    #[test]
    fn test_history_is_capped() {
        let reg = registry(3);
        let s = reg.get_or_create(&SessionKey::new(1, "backend"));
        for i in 0..5 {
            s.record(&format!("p{}", i), ExecutionResult::failure("e", s.working_dir()));
        }
        let history = s.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].prompt, "p2");
        assert_eq!(history[2].prompt, "p4");
        assert_eq!(s.interactions(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let reg = Arc::new(registry(10));
        let key = SessionKey::new(9, "root");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let key = key.clone();
                tokio::spawn(async move { reg.get_or_create(&key) })
            })
            .collect();

        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.len(), 1);
    }
}
