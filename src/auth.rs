//! Access control: allow-list and per-user rate limiting
//!
//! Both are checked before any work is done for a request. The rate limiter
//! uses a sliding window; rejected requests are not counted against the user.

use parking_lot::RwLock as SyncRwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Rate limit window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Telegram user ids allowed to use the bot. Empty means everyone.
#[derive(Debug, Default)]
pub struct AllowList {
    users: SyncRwLock<HashSet<i64>>,
}

impl AllowList {
    pub fn new(users: impl IntoIterator<Item = i64>) -> Self {
        Self {
            users: SyncRwLock::new(users.into_iter().collect()),
        }
    }

    pub fn is_authorized(&self, user_id: i64) -> bool {
        let users = self.users.read();
        users.is_empty() || users.contains(&user_id)
    }

    /// True when no restriction is configured
    pub fn is_open(&self) -> bool {
        self.users.read().is_empty()
    }

    pub fn add(&self, user_id: i64) -> bool {
        let added = self.users.write().insert(user_id);
        if added {
            info!("Added user {} to allow-list", user_id);
        }
        added
    }

    /// Removing the last id opens the bot to everyone
    pub fn remove(&self, user_id: i64) -> bool {
        let mut users = self.users.write();
        let removed = users.remove(&user_id);
        if removed {
            info!("Removed user {} from allow-list", user_id);
            if users.is_empty() {
                warn!("Allow-list is now empty - bot accepts requests from anyone");
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_open()
    }
}

/// Sliding-window rate limiter, one window per user
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    /// user_id -> accepted request times inside the window
    requests: RwLock<HashMap<i64, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize) -> Self {
        Self::with_window(max_requests, RATE_WINDOW)
    }

    pub fn with_window(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Record a request if the user is under the limit. Returns true if allowed.
    pub async fn check(&self, user_id: i64) -> bool {
        self.check_at(user_id, Instant::now()).await
    }

    pub async fn check_at(&self, user_id: i64, now: Instant) -> bool {
        let mut requests = self.requests.write().await;
        let times = requests.entry(user_id).or_default();
        prune(times, now, self.window);

        if times.len() >= self.max_requests {
            debug!("User {} rate limited ({} in window)", user_id, times.len());
            return false;
        }

        times.push(now);
        true
    }

    /// Requests the user may still make in the current window
    pub async fn remaining(&self, user_id: i64) -> usize {
        self.remaining_at(user_id, Instant::now()).await
    }

    pub async fn remaining_at(&self, user_id: i64, now: Instant) -> usize {
        let requests = self.requests.read().await;
        let used = requests
            .get(&user_id)
            .map(|times| times.iter().filter(|&&t| in_window(t, now, self.window)).count())
            .unwrap_or(0);
        self.max_requests.saturating_sub(used)
    }

    pub async fn reset(&self, user_id: i64) {
        self.requests.write().await.remove(&user_id);
    }
}

fn in_window(t: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(t) < window
}

fn prune(times: &mut Vec<Instant>, now: Instant, window: Duration) {
    times.retain(|&t| in_window(t, now, window));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allow_list_admits_everyone() {
        let list = AllowList::default();
        assert!(list.is_open());
        assert!(list.is_authorized(1));
        assert!(list.is_authorized(-99));
    }

    #[test]
    fn test_allow_list_membership() {
        let list = AllowList::new([10, 20]);
        assert!(list.is_authorized(10));
        assert!(!list.is_authorized(30));

        assert!(list.add(30));
        assert!(!list.add(30));
        assert!(list.is_authorized(30));

        assert!(list.remove(10));
        assert!(!list.is_authorized(10));
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_burst_then_window_recovery() {
        let limiter = RateLimiter::new(3);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(7, t0).await);
        }
        assert!(!limiter.check_at(7, t0).await);
        assert_eq!(limiter.remaining_at(7, t0).await, 0);

        // Rejections are not counted, so the window clears on schedule
        let later = t0 + Duration::from_secs(61);
        assert_eq!(limiter.remaining_at(7, later).await, 3);
        assert!(limiter.check_at(7, later).await);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(1).await);
        assert!(!limiter.check(1).await);
        assert!(limiter.check(2).await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2);
        let t0 = Instant::now();
        assert!(limiter.check_at(1, t0).await);
        assert!(limiter.check_at(1, t0 + Duration::from_secs(30)).await);
        assert!(!limiter.check_at(1, t0 + Duration::from_secs(59)).await);
        // First request has left the window, second has not
        assert!(limiter.check_at(1, t0 + Duration::from_secs(60)).await);
        assert!(!limiter.check_at(1, t0 + Duration::from_secs(61)).await);
    }

    #[tokio::test]
    async fn test_reset() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(5).await);
        assert!(!limiter.check(5).await);
        limiter.reset(5).await;
        assert!(limiter.check(5).await);
    }
}
