//! Per-client sliding window admission control.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Window used by the gateway's per-IP limit.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `max_requests` per key within any `window`.
///
/// Keys whose window has emptied are dropped, so memory is bounded by the
/// number of clients active within the last window. Idle keys are swept at
/// most once per window, on whichever call comes next.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    requests: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl State {
    // Drop every key whose newest request left the window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        match self.last_sweep {
            Some(last) if now.saturating_duration_since(last) < window => {}
            Some(_) => {
                self.requests.retain(|_, queue| {
                    queue
                        .back()
                        .is_some_and(|t| now.saturating_duration_since(*t) < window)
                });
                self.last_sweep = Some(now);
            }
            None => self.last_sweep = Some(now),
        }
    }
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(State::default()),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Record a request for `key` now; false if over the limit.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.sweep(now, self.window);
        let requests = &mut state.requests;

        if let Some(queue) = requests.get_mut(key) {
            while queue
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
            {
                queue.pop_front();
            }
            if queue.is_empty() {
                requests.remove(key);
            }
        }

        let queue = requests.entry(key.to_string()).or_default();
        if queue.len() >= self.max_requests {
            // Never leave an empty entry behind (max_requests == 0).
            if queue.is_empty() {
                requests.remove(key);
            }
            return false;
        }
        queue.push_back(now);
        true
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allows_exactly_max() {
        let limiter = RateLimiter::new(2, DEFAULT_WINDOW);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_allows_again_after_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at("10.0.0.1", t0));
        }
        assert!(!limiter.allow_at("10.0.0.1", t0 + Duration::from_secs(9)));
        assert!(limiter.allow_at("10.0.0.1", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(limiter.allow_at("k", t0));
        assert!(limiter.allow_at("k", t0 + Duration::from_secs(6)));
        assert!(!limiter.allow_at("k", t0 + Duration::from_secs(8)));
        // First request expired, second still counts.
        assert!(limiter.allow_at("k", t0 + Duration::from_secs(11)));
        assert!(!limiter.allow_at("k", t0 + Duration::from_secs(12)));
    }

    #[test]
    fn test_keys_independent() {
        let limiter = RateLimiter::new(1, DEFAULT_WINDOW);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_stale_keys_evicted() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.allow_at("old", t0);
        assert_eq!(limiter.tracked_keys(), 1);
        limiter.allow_at("old", t0 + Duration::from_secs(5));
        assert_eq!(limiter.tracked_keys(), 1);
        // Another client's request sweeps "old" out.
        limiter.allow_at("new", t0 + Duration::from_secs(10));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_idle_clients_do_not_accumulate() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..1000 {
            assert!(limiter.allow_at(&format!("10.0.{}.{}", i / 256, i % 256), t0));
        }
        assert_eq!(limiter.tracked_keys(), 1000);

        assert!(limiter.allow_at("fresh", t0 + Duration::from_secs(3600)));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_keys() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();
        limiter.allow_at("idle", t0);
        limiter.allow_at("busy", t0 + Duration::from_secs(8));
        limiter.allow_at("late", t0 + Duration::from_secs(12));
        // "idle" expired, "busy" is still inside its window.
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_zero_limit_denies_and_tracks_nothing() {
        let limiter = RateLimiter::new(0, DEFAULT_WINDOW);
        assert!(!limiter.allow("k"));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(100, DEFAULT_WINDOW));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..50).filter(|_| limiter.allow("shared")).count())
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
    }
}
