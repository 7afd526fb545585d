//! Shared counter store abstraction.
//!
//! A [`CounterStore`] is the key-value service the detector uses to share
//! per-client counts between processes. Expiry of every key is handled by the
//! store itself through per-key TTLs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GuardResult;

/// Boxed future returned by [`CounterStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = GuardResult<T>> + Send + 'a>>;

/// Upper bound used when an expiry would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Instant `ttl` after `now`, saturating instead of overflowing.
pub(crate) fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Result of one store increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCount {
    /// Count of the current window; the frozen count while blocked.
    pub count: u64,
    /// Whether the block key was present, in which case nothing was incremented.
    pub blocked: bool,
}

/// Key-value store holding shared request counters.
///
/// Each operation is a single atomic round trip, so concurrent requests for
/// the same client never lose an increment and never observe half a block.
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Count one request for the client owning `keys`.
    ///
    /// When the block key exists its value is returned with `blocked = true`
    /// and the count key is left alone. Otherwise the count key is
    /// incremented; a newly created count key expires after `window`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the backend cannot be reached.
    fn increment<'a>(&'a self, keys: &'a ClientKeys, window: Duration)
    -> StoreFuture<'a, StoreCount>;

    /// Block the client owning `keys` for `ttl`.
    ///
    /// Writes the current count (1 if absent) to the block key and re-stamps
    /// the count key, both expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the backend cannot be reached.
    fn place_block<'a>(&'a self, keys: &'a ClientKeys, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Drop expired keys held in process memory, returning how many were removed.
    ///
    /// Stores that expire keys on their own keep the default no-op.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Builds the namespaced keys owned by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a key builder with the given namespace prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Both keys belonging to `identifier`.
    #[must_use]
    pub fn client(&self, identifier: &str) -> ClientKeys {
        ClientKeys {
            count: format!("{}count:{identifier}", self.prefix),
            block: format!("{}block:{identifier}", self.prefix),
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Store keys of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeys {
    /// Key holding the request count of the current window.
    pub count: String,
    /// Key whose presence marks the client as blocked.
    pub block: String,
}

#[derive(Debug, Clone, Copy)]
struct StoredValue {
    value: u64,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`CounterStore`] with per-key expiry.
///
/// Suitable for single-node deployments that still want the store-backed
/// code path, and for tests. Expired keys are dropped lazily on access and
/// in bulk by [`CounterStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, if it exists and has not expired.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value)
    }

    /// Number of keys currently held, including not yet purged expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn increment_now(&self, keys: &ClientKeys, window: Duration) -> StoreCount {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(&keys.block).map(|b| (b.value, b.is_live(now))) {
            Some((count, true)) => return StoreCount { count, blocked: true },
            Some((_, false)) => {
                entries.remove(&keys.block);
            }
            None => {}
        }

        let fresh = StoredValue {
            value: 0,
            expires_at: expiry_after(now, window),
        };
        let stored = entries.entry(keys.count.clone()).or_insert(fresh);
        if !stored.is_live(now) {
            *stored = fresh;
        }
        stored.value = stored.value.saturating_add(1);
        StoreCount {
            count: stored.value,
            blocked: false,
        }
    }

    fn place_block_now(&self, keys: &ClientKeys, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let count = entries
            .get(&keys.count)
            .filter(|stored| stored.is_live(now))
            .map_or(1, |stored| stored.value);
        let stamped = StoredValue {
            value: count,
            expires_at: expiry_after(now, ttl),
        };
        entries.insert(keys.block.clone(), stamped);
        entries.insert(keys.count.clone(), stamped);
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment<'a>(
        &'a self,
        keys: &'a ClientKeys,
        window: Duration,
    ) -> StoreFuture<'a, StoreCount> {
        Box::pin(async move { Ok(self.increment_now(keys, window)) })
    }

    fn place_block<'a>(&'a self, keys: &'a ClientKeys, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.place_block_now(keys, ttl);
            Ok(())
        })
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired counter keys");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn keys() -> ClientKeys {
        StoreKeys::new("ddos:").client("10.0.0.5")
    }

    #[test]
    fn test_store_keys_are_namespaced() {
        let store_keys = StoreKeys::new("ddos:");
        let keys = store_keys.client("10.0.0.5");
        assert_eq!(keys.count, "ddos:count:10.0.0.5");
        assert_eq!(keys.block, "ddos:block:10.0.0.5");
        assert_eq!(store_keys.prefix(), "ddos:");
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_creates_and_increments() {
        let store = MemoryCounterStore::new();
        let keys = keys();

        assert_eq!(store.increment(&keys, WINDOW).await.unwrap().count, 1);
        let second = store.increment(&keys, WINDOW).await.unwrap();
        assert_eq!(second, StoreCount { count: 2, blocked: false });
        assert_eq!(store.value(&keys.count), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_original_expiry() {
        let store = MemoryCounterStore::new();
        let keys = keys();
        let window = Duration::from_secs(10);

        store.increment(&keys, window).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.increment(&keys, window).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        // 11s after creation the key is gone even though it was touched at 6s.
        assert_eq!(store.value(&keys.count), None);
        assert_eq!(store.increment(&keys, window).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_freezes_count() {
        let store = MemoryCounterStore::new();
        let keys = keys();

        store.increment(&keys, WINDOW).await.unwrap();
        store.increment(&keys, WINDOW).await.unwrap();
        store.place_block(&keys, Duration::from_secs(30)).await.unwrap();

        for _ in 0..3 {
            let counted = store.increment(&keys, WINDOW).await.unwrap();
            assert_eq!(counted, StoreCount { count: 2, blocked: true });
        }
        assert_eq!(store.value(&keys.count), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_restamps_count_key() {
        let store = MemoryCounterStore::new();
        let keys = keys();

        store.increment(&keys, Duration::from_secs(5)).await.unwrap();
        store.place_block(&keys, Duration::from_secs(30)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        // The count outlives its original 5s window while the block holds.
        assert_eq!(store.value(&keys.count), Some(1));

        tokio::time::advance(Duration::from_secs(20)).await;
        let counted = store.increment(&keys, WINDOW).await.unwrap();
        assert_eq!(counted, StoreCount { count: 1, blocked: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_does_not_overflow() {
        let store = MemoryCounterStore::new();
        let keys = keys();

        store.increment(&keys, Duration::MAX).await.unwrap();
        store.place_block(&keys, Duration::from_secs(u64::MAX)).await.unwrap();

        assert!(store.increment(&keys, WINDOW).await.unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_saturates() {
        let now = Instant::now();

        assert_eq!(expiry_after(now, WINDOW), now + WINDOW);
        assert!(expiry_after(now, Duration::MAX) > now + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        let short = StoreKeys::new("t:").client("short");
        let long = StoreKeys::new("t:").client("long");

        store.increment(&short, Duration::from_secs(1)).await.unwrap();
        store.increment(&long, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(!store.is_empty());
    }
}
