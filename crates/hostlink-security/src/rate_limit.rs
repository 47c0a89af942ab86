//! Sliding-window rate limiter keyed by caller identifier.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use hostlink_core::now_millis;
use hostlink_core::time::duration_millis;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::SecurityError;

/// Recent request history for one caller.
#[derive(Debug, Default)]
struct RequestTracker {
    requests: VecDeque<i64>,
    blocked: bool,
    blocked_at: i64,
}

impl RequestTracker {
    fn prune(&mut self, now: i64, window: i64) {
        while let Some(&oldest) = self.requests.front() {
            if now - oldest >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Admits at most `max_requests` per caller within any `window`.
///
/// A caller that hits the limit is blocked for one full window from the
/// moment of the violation.
#[derive(Clone)]
pub struct RateLimiter {
    trackers: Arc<RwLock<HashMap<String, RequestTracker>>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            trackers: Arc::new(RwLock::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    pub const fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admit or reject one request from `id`.
    pub async fn check(&self, id: &str) -> Result<(), SecurityError> {
        self.check_at(id, now_millis()).await
    }

    pub async fn check_at(&self, id: &str, now: i64) -> Result<(), SecurityError> {
        let window = duration_millis(self.window);
        let mut trackers = self.trackers.write().await;
        let tracker = trackers.entry(id.to_string()).or_default();

        tracker.prune(now, window);

        if tracker.blocked {
            if now - tracker.blocked_at < window {
                return Err(SecurityError::RateLimited(id.to_string()));
            }
            tracker.blocked = false;
        }

        if tracker.requests.len() >= self.max_requests {
            tracker.blocked = true;
            tracker.blocked_at = now;
            warn!(caller = id, limit = self.max_requests, "Rate limit exceeded");
            return Err(SecurityError::RateLimited(id.to_string()));
        }

        tracker.requests.push_back(now);
        Ok(())
    }

    /// Admissions left for `id` in the current window.
    pub async fn remaining(&self, id: &str) -> usize {
        self.remaining_at(id, now_millis()).await
    }

    pub async fn remaining_at(&self, id: &str, now: i64) -> usize {
        let window = duration_millis(self.window);
        let trackers = self.trackers.read().await;
        trackers.get(id).map_or(self.max_requests, |tracker| {
            if tracker.blocked && now - tracker.blocked_at < window {
                return 0;
            }
            let live = tracker
                .requests
                .iter()
                .filter(|&&t| now - t < window)
                .count();
            self.max_requests.saturating_sub(live)
        })
    }

    /// Forget a caller's history.
    pub async fn reset(&self, id: &str) {
        self.trackers.write().await.remove(id);
    }

    /// Drop trackers that have no requests in the window and are not blocked.
    pub async fn sweep_idle_at(&self, now: i64) -> usize {
        let window = duration_millis(self.window);
        let mut trackers = self.trackers.write().await;
        let before = trackers.len();
        trackers.retain(|_, tracker| {
            tracker.prune(now, window);
            let blocking = tracker.blocked && now - tracker.blocked_at < window;
            blocking || !tracker.requests.is_empty()
        });
        before - trackers.len()
    }

    pub async fn tracked(&self) -> usize {
        self.trackers.read().await.len()
    }
}
