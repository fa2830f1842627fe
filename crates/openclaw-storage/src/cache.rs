//! Per-process value cache for the file backend.
//!
//! Thread-safe via `DashMap`. An entry is served only while its TTL has not
//! elapsed AND the on-disk mtime still matches the mtime recorded at load
//! time, so out-of-band file edits are picked up within one read. A zero TTL
//! disables caching entirely.

use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: Value,
    loaded_at: Instant,
    mtime_ms: i64,
}

/// mtime-validated TTL cache. Values are cloned in and out, so callers can
/// never alias the cached document.
pub struct ValueCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ValueCache {
    /// Create a cache with the given TTL. `Duration::ZERO` disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a cached value, given the file's current on-disk mtime. Returns
    /// `None` (and evicts) when the entry is expired or the file changed.
    pub fn get(&self, key: &str, disk_mtime_ms: i64) -> Option<Value> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.loaded_at.elapsed() > self.ttl || entry.mtime_ms != disk_mtime_ms {
            drop(entry); // release read lock before removing
            self.entries.remove(key);
            None
        } else {
            Some(entry.value.clone())
        }
    }

    /// Record a freshly loaded value. No-op when caching is disabled.
    pub fn put(&self, key: String, value: Value, mtime_ms: i64) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                loaded_at: Instant::now(),
                mtime_ms,
            },
        );
    }

    /// Drop a single entry. Called on every mutation of the backing file.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let cache = ValueCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), json!({"a": 1}), 100);
        assert_eq!(cache.get("k", 100), Some(json!({"a": 1})));
    }

    #[test]
    fn test_miss() {
        let cache = ValueCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("absent", 0), None);
    }

    #[test]
    fn test_mtime_change_evicts() {
        let cache = ValueCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), json!(1), 100);
        assert_eq!(cache.get("k", 101), None);
        // The stale entry is gone even for the original mtime.
        assert_eq!(cache.get("k", 100), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ValueCache::new(Duration::from_millis(1));
        cache.put("k".to_string(), json!(1), 100);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("k", 100), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = ValueCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), json!(1), 100);
        cache.invalidate("k");
        assert_eq!(cache.get("k", 100), None);
    }

    #[test]
    fn test_zero_ttl_disables() {
        let cache = ValueCache::new(Duration::ZERO);
        cache.put("k".to_string(), json!(1), 100);
        assert_eq!(cache.get("k", 100), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_returned_value_is_a_copy() {
        let cache = ValueCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), json!({"n": 1}), 100);
        let mut out = cache.get("k", 100).unwrap();
        out["n"] = json!(2);
        assert_eq!(cache.get("k", 100), Some(json!({"n": 1})));
    }
}
