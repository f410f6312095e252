//! In-process coordination store.

use super::store::CoordinationStore;
use crate::error::StoreError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Minimum time between two sweeps of expired entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Entries {
    map: HashMap<String, Entry>,
    swept_at: Instant,
}

impl Entries {
    /// Drop every expired entry, at most once per [`SWEEP_INTERVAL`]
    fn sweep(&mut self, now: Instant) {
        if now.duration_since(self.swept_at) < SWEEP_INTERVAL {
            return;
        }
        self.map.retain(|_, e| e.is_live(now));
        self.swept_at = now;
    }
}

/// [`CoordinationStore`] backed by a process-local map
///
/// Exclusivity holds between workers of one process only. Expired entries are
/// hidden immediately and swept out on writes. Expiry follows tokio's clock,
/// so tests can drive TTLs with a paused runtime.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<Entries>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    /// Remaining lifetime of `key`, if it holds an unexpired value
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .map
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }

    /// Number of unexpired entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.map.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no unexpired entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl CoordinationStore for InMemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.sweep(now);
        if entries.map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.sweep(now);
        entries.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.map.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.map.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.map.get(key) {
            Some(e) if e.is_live(now) && e.value == expected => {
                entries.map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_refuses_live_entries_and_accepts_expired_ones() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_reports_remaining_lifetime() {
        let store = InMemoryStore::new();
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(store.ttl("k").await, Some(Duration::from_secs(45)));
        assert_eq!(store.ttl("missing").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_out_expired_entries() {
        let store = InMemoryStore::new();
        for i in 0..10_000 {
            store
                .set(&format!("task-completed:{i}"), "v", Duration::from_secs(1))
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        for i in 0..10 {
            assert!(
                store
                    .set_if_absent(&format!("task-lock:{i}"), "h", Duration::from_secs(60))
                    .await
                    .unwrap()
            );
        }

        assert_eq!(store.len().await, 10);
        assert_eq!(store.entries.lock().await.map.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_are_rate_limited() {
        let store = InMemoryStore::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        store.set("old", "v", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.set("new", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.entries.lock().await.map.len(), 2);
        assert_eq!(store.len().await, 1);

        tokio::time::advance(SWEEP_INTERVAL).await;
        store.set("newer", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.entries.lock().await.map.len(), 2);
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_value() {
        let store = InMemoryStore::new();
        store.set("k", "mine", Duration::from_secs(60)).await.unwrap();

        assert!(!store.delete_if_equals("k", "theirs").await.unwrap());
        assert_eq!(store.len().await, 1);

        assert!(store.delete_if_equals("k", "mine").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = InMemoryStore::new();
        store.set("k", "v", Duration::from_secs(60)).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
