//! In-process rate limiting: a fixed-window counter per user for the HTTP
//! surface, and a minimum-spacing throttle per instance for location
//! frames (§4.3, §5, §9). Both are a single `Mutex<HashMap<...>>` guarding
//! small per-key state, the shape `GroupQueue::Inner` uses for per-group
//! state — a lock held only across the map lookup, never across an await
//! on the store or cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Window {
    count: u32,
    window_started_at: Instant,
}

/// Per-user fixed-window limiter for journey HTTP endpoints.
pub struct RequestRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_per_window: u32,
    window: Duration,
}

impl RequestRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_per_window,
            window,
        }
    }

    /// Returns `true` if the call is allowed under the current window.
    pub async fn allow(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            window_started_at: now,
        });

        if now.duration_since(entry.window_started_at) >= self.window {
            entry.count = 0;
            entry.window_started_at = now;
        }

        if entry.count >= self.max_per_window {
            return false;
        }
        entry.count += 1;
        true
    }
}

/// Per-instance minimum-spacing throttle for `updateLocation` frames sent
/// over a socket connection. Frames arriving before the interval elapses
/// are dropped silently; dropped frames never reach the pipeline and so
/// never advance statistics.
pub struct LocationThrottle {
    last_accepted: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl LocationThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_accepted: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    pub async fn allow(&self, instance_id: &str) -> bool {
        let mut last_accepted = self.last_accepted.lock().await;
        let now = Instant::now();
        match last_accepted.get(instance_id) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_accepted.insert(instance_id.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_limiter_allows_up_to_the_cap() {
        let limiter = RequestRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("user-1").await);
        assert!(limiter.allow("user-1").await);
        assert!(!limiter.allow("user-1").await);
    }

    #[tokio::test]
    async fn request_limiter_tracks_keys_independently() {
        let limiter = RequestRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("user-1").await);
        assert!(limiter.allow("user-2").await);
    }

    #[tokio::test]
    async fn location_throttle_drops_rapid_frames() {
        let throttle = LocationThrottle::new(Duration::from_millis(50));
        assert!(throttle.allow("instance-1").await);
        assert!(!throttle.allow("instance-1").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(throttle.allow("instance-1").await);
    }
}
