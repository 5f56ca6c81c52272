//! In-process TTL cache fronting the store.
//!
//! Never authoritative, never fails a request: a disabled or empty cache
//! degrades to a miss. Keyed by the `:`-joined grammar in §4.1; pattern
//! invalidation (`del_pattern`) supports the single trailing-wildcard
//! patterns the coordinator actually issues (e.g. `group-journey:{id}:*`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at < Instant::now()
    }
}

pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    disabled: bool,
}

impl Cache {
    pub fn new(disabled: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disabled,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.disabled {
            return None;
        }
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if self.disabled {
            return;
        }
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn del(&self, key: &str) {
        if self.disabled {
            return;
        }
        self.entries.write().await.remove(key);
    }

    /// Remove every key matching `pattern`, where `pattern` ends in `*`
    /// (a prefix match) or is an exact key otherwise.
    pub async fn del_pattern(&self, pattern: &str) {
        if self.disabled {
            return;
        }
        let mut entries = self.entries.write().await;
        if let Some(prefix) = pattern.strip_suffix('*') {
            entries.retain(|k, _| !k.starts_with(prefix));
        } else {
            entries.remove(pattern);
        }
    }
}

pub mod keys {
    pub fn group(id: &str) -> String {
        format!("group:{id}")
    }

    pub fn group_active_journey(id: &str) -> String {
        format!("group:{id}:active-journey")
    }

    pub fn group_journey(id: &str) -> String {
        format!("group-journey:{id}")
    }

    pub fn group_journey_full(id: &str) -> String {
        format!("group-journey:{id}:full")
    }

    pub fn group_journey_full_pattern(id: &str) -> String {
        format!("group-journey:{id}:full*")
    }

    pub fn instance(id: &str) -> String {
        format!("instance:{id}")
    }

    pub fn user_instance(user_id: &str, journey_id: &str) -> String {
        format!("user:{user_id}:instance:{journey_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let cache = Cache::new(false);
        cache.set("k", &42i32, Duration::from_secs(60)).await;
        assert_eq!(cache.get::<i32>("k").await, Some(42));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = Cache::new(false);
        cache.set("k", &42i32, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn disabled_cache_is_always_a_miss() {
        let cache = Cache::new(true);
        cache.set("k", &42i32, Duration::from_secs(60)).await;
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn del_pattern_removes_prefix_matches() {
        let cache = Cache::new(false);
        cache.set("group-journey:1:full", &1i32, Duration::from_secs(60)).await;
        cache.set("group-journey:1:full:extra", &2i32, Duration::from_secs(60)).await;
        cache.set("group-journey:2:full", &3i32, Duration::from_secs(60)).await;
        cache.del_pattern(&keys::group_journey_full_pattern("1")).await;
        assert_eq!(cache.get::<i32>("group-journey:1:full").await, None);
        assert_eq!(cache.get::<i32>("group-journey:1:full:extra").await, None);
        assert_eq!(cache.get::<i32>("group-journey:2:full").await, Some(3));
    }
}
