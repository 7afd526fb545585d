//! Per-client request counters.
//!
//! Two interchangeable strategies implement [`RequestCounter`]:
//!
//! - [`LocalCounter`] - process-local map, never fails
//! - [`StoreBackedCounter`] - shared [`CounterStore`], may fail or time out
//!
//! The detector picks the store-backed counter when one is configured and
//! falls back to the local one whenever the store misbehaves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GuardResult;
use crate::store::{CounterStore, StoreKeys};

/// Tracking record for one client identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCounter {
    /// Client address the requests are attributed to.
    pub identifier: String,
    /// Requests seen in the current window.
    pub count: u64,
    /// When the current window began.
    pub window_start: Instant,
    /// Whether the client is under a temporary block.
    pub blocked: bool,
    /// When the block lifts, if blocked.
    pub blocked_until: Option<Instant>,
}

impl ClientCounter {
    fn fresh(identifier: &str, now: Instant) -> Self {
        Self {
            identifier: identifier.to_string(),
            count: 1,
            window_start: now,
            blocked: false,
            blocked_until: None,
        }
    }

    fn window_expired(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    fn block_expired(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now >= until)
    }

    /// Whether this record no longer carries any state worth keeping.
    fn is_stale(&self, window: Duration, now: Instant) -> bool {
        if self.blocked {
            self.block_expired(now)
        } else {
            self.window_expired(window, now)
        }
    }
}

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Count after this request; not incremented while blocked.
    pub count: u64,
    /// Whether the client was already blocked before this request.
    pub blocked: bool,
}

/// Boxed future returned by [`RequestCounter`] operations.
pub type CounterFuture<'a, T> = Pin<Box<dyn Future<Output = GuardResult<T>> + Send + 'a>>;

/// Counting strategy shared by the local and store-backed variants.
pub trait RequestCounter: Send + Sync {
    /// Count one request for `identifier` at `now`.
    ///
    /// A blocked client is reported as blocked and its count is left alone.
    ///
    /// # Errors
    ///
    /// Returns a store error when the backing storage cannot be used.
    fn increment<'a>(&'a self, identifier: &'a str, now: Instant)
    -> CounterFuture<'a, CounterSnapshot>;

    /// Place `identifier` under a block lasting from `now` until `until`.
    ///
    /// # Errors
    ///
    /// Returns a store error when the backing storage cannot be used.
    fn mark_blocked<'a>(
        &'a self,
        identifier: &'a str,
        until: Instant,
        now: Instant,
    ) -> CounterFuture<'a, ()>;
}

/// Process-local counter map.
///
/// All mutations happen under one lock, so concurrent requests for the same
/// identifier are serialized and no increment is lost.
#[derive(Debug)]
pub struct LocalCounter {
    window: Duration,
    clients: Mutex<HashMap<String, ClientCounter>>,
}

impl LocalCounter {
    /// Create a local counter with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request synchronously.
    pub fn increment_now(&self, identifier: &str, now: Instant) -> CounterSnapshot {
        let mut clients = self.clients.lock();

        if let Some(counter) = clients.get_mut(identifier) {
            if counter.blocked {
                if !counter.block_expired(now) {
                    return CounterSnapshot {
                        count: counter.count,
                        blocked: true,
                    };
                }
                debug!(identifier = %identifier, "Block expired, starting fresh window");
                *counter = ClientCounter::fresh(identifier, now);
            } else if counter.window_expired(self.window, now) {
                *counter = ClientCounter::fresh(identifier, now);
            } else {
                counter.count = counter.count.saturating_add(1);
            }
            return CounterSnapshot {
                count: counter.count,
                blocked: false,
            };
        }

        clients.insert(identifier.to_string(), ClientCounter::fresh(identifier, now));
        CounterSnapshot {
            count: 1,
            blocked: false,
        }
    }

    /// Snapshot of `identifier` if it is under a block that has not run out.
    ///
    /// Nothing is counted.
    #[must_use]
    pub fn active_block(&self, identifier: &str, now: Instant) -> Option<CounterSnapshot> {
        self.clients
            .lock()
            .get(identifier)
            .filter(|counter| counter.blocked && !counter.block_expired(now))
            .map(|counter| CounterSnapshot {
                count: counter.count,
                blocked: true,
            })
    }

    /// Block `identifier` until `until`, creating a record if none exists.
    pub fn block_now(&self, identifier: &str, until: Instant, now: Instant) {
        let mut clients = self.clients.lock();
        let counter = clients
            .entry(identifier.to_string())
            .or_insert_with(|| ClientCounter::fresh(identifier, now));
        counter.blocked = true;
        counter.blocked_until = Some(until);
    }

    /// Evict records whose window or block has run out.
    ///
    /// Returns the number of evicted records.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, counter| !counter.is_stale(self.window, now));
        let removed = before.saturating_sub(clients.len());
        if removed > 0 {
            debug!(removed = removed, remaining = clients.len(), "Swept stale client counters");
        }
        removed
    }

    /// Current record for `identifier`, if tracked.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<ClientCounter> {
        self.clients.lock().get(identifier).cloned()
    }

    /// Number of tracked identifiers.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Number of identifiers currently marked blocked.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.clients.lock().values().filter(|c| c.blocked).count()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.clients.lock().clear();
    }

    /// The counting window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl RequestCounter for LocalCounter {
    fn increment<'a>(
        &'a self,
        identifier: &'a str,
        now: Instant,
    ) -> CounterFuture<'a, CounterSnapshot> {
        Box::pin(async move { Ok(self.increment_now(identifier, now)) })
    }

    fn mark_blocked<'a>(
        &'a self,
        identifier: &'a str,
        until: Instant,
        now: Instant,
    ) -> CounterFuture<'a, ()> {
        Box::pin(async move {
            self.block_now(identifier, until, now);
            Ok(())
        })
    }
}

/// Counter delegating storage to a shared [`CounterStore`].
///
/// Window and block expiry are carried by key TTLs in the store.
#[derive(Debug, Clone)]
pub struct StoreBackedCounter {
    store: Arc<dyn CounterStore>,
    keys: StoreKeys,
    window: Duration,
}

impl StoreBackedCounter {
    /// Create a store-backed counter.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, keys: StoreKeys, window: Duration) -> Self {
        Self {
            store,
            keys,
            window,
        }
    }

    /// The key namespace in use.
    #[must_use]
    pub const fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Let the underlying store drop keys it holds in process memory.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}

impl RequestCounter for StoreBackedCounter {
    fn increment<'a>(
        &'a self,
        identifier: &'a str,
        _now: Instant,
    ) -> CounterFuture<'a, CounterSnapshot> {
        Box::pin(async move {
            let keys = self.keys.client(identifier);
            let counted = self.store.increment(&keys, self.window).await?;
            Ok(CounterSnapshot {
                count: counted.count,
                blocked: counted.blocked,
            })
        })
    }

    fn mark_blocked<'a>(
        &'a self,
        identifier: &'a str,
        until: Instant,
        now: Instant,
    ) -> CounterFuture<'a, ()> {
        Box::pin(async move {
            let keys = self.keys.client(identifier);
            let ttl = until.saturating_duration_since(now);
            self.store.place_block(&keys, ttl).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    const WINDOW: Duration = Duration::from_secs(60);

    // ==================== LocalCounter Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_local_counts_within_window() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        assert_eq!(counter.increment_now("a", now).count, 1);
        assert_eq!(counter.increment_now("a", now).count, 2);
        assert_eq!(counter.increment_now("a", now + Duration::from_secs(59)).count, 3);
        assert_eq!(counter.tracked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_resets_after_window() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("a", now);
        counter.increment_now("a", now);
        let snapshot = counter.increment_now("a", now + WINDOW);

        assert_eq!(snapshot.count, 1);
        let record = counter.get("a").unwrap();
        assert_eq!(record.window_start, now + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_blocked_does_not_increment() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("a", now);
        counter.increment_now("a", now);
        counter.block_now("a", now + Duration::from_secs(10), now);

        for _ in 0..5 {
            let snapshot = counter.increment_now("a", now + Duration::from_secs(1));
            assert!(snapshot.blocked);
            assert_eq!(snapshot.count, 2);
        }
        assert_eq!(counter.blocked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_block_expiry_starts_fresh() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("a", now);
        counter.block_now("a", now + Duration::from_secs(10), now);

        let snapshot = counter.increment_now("a", now + Duration::from_secs(10));
        assert!(!snapshot.blocked);
        assert_eq!(snapshot.count, 1);
        assert_eq!(counter.blocked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_identifiers_are_independent() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("a", now);
        counter.increment_now("a", now);
        counter.block_now("a", now + WINDOW, now);

        let snapshot = counter.increment_now("b", now);
        assert_eq!(snapshot.count, 1);
        assert!(!snapshot.blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_sweep_evicts_stale_records() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("expired-window", now);
        counter.increment_now("live-window", now + Duration::from_secs(30));
        counter.increment_now("expired-block", now);
        counter.block_now("expired-block", now + Duration::from_secs(5), now);
        counter.increment_now("live-block", now);
        counter.block_now("live-block", now + Duration::from_secs(600), now);

        let removed = counter.sweep(now + Duration::from_secs(61));

        assert_eq!(removed, 2);
        assert!(counter.get("expired-window").is_none());
        assert!(counter.get("expired-block").is_none());
        assert!(counter.get("live-window").is_some());
        assert!(counter.get("live-block").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_blocked_record_outlives_window_until_block_ends() {
        let counter = LocalCounter::new(Duration::from_secs(10));
        let now = Instant::now();

        counter.increment_now("a", now);
        counter.block_now("a", now + Duration::from_secs(300), now);

        assert_eq!(counter.sweep(now + Duration::from_secs(60)), 0);
        assert!(counter.increment_now("a", now + Duration::from_secs(60)).blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_active_block() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();

        counter.increment_now("a", now);
        assert_eq!(counter.active_block("a", now), None);
        assert_eq!(counter.active_block("missing", now), None);

        counter
            .mark_blocked("a", now + Duration::from_secs(10), now)
            .await
            .unwrap();
        let snapshot = counter.active_block("a", now + Duration::from_secs(9)).unwrap();
        assert!(snapshot.blocked);
        assert_eq!(snapshot.count, 1);
        assert_eq!(counter.active_block("a", now + Duration::from_secs(10)), None);
    }

    #[tokio::test]
    async fn test_local_concurrent_increments_are_not_lost() {
        let counter = Arc::new(LocalCounter::new(WINDOW));
        let now = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    counter.increment("shared", now).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.get("shared").unwrap().count, 800);
    }

    #[test]
    fn test_local_clear() {
        let counter = LocalCounter::new(WINDOW);
        let now = Instant::now();
        counter.increment_now("a", now);
        counter.increment_now("b", now);

        counter.clear();
        assert_eq!(counter.tracked_count(), 0);
        assert_eq!(counter.window(), WINDOW);
    }

    // ==================== StoreBackedCounter Tests ====================

    fn store_counter() -> (Arc<MemoryCounterStore>, StoreBackedCounter) {
        let store = Arc::new(MemoryCounterStore::new());
        let counter = StoreBackedCounter::new(store.clone(), StoreKeys::new("test:"), WINDOW);
        (store, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_counts_and_expires_window() {
        let (_store, counter) = store_counter();

        assert_eq!(counter.increment("a", Instant::now()).await.unwrap().count, 1);
        assert_eq!(counter.increment("a", Instant::now()).await.unwrap().count, 2);

        tokio::time::advance(WINDOW).await;
        assert_eq!(counter.increment("a", Instant::now()).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_block_short_circuits() {
        let (store, counter) = store_counter();

        counter.increment("a", Instant::now()).await.unwrap();
        counter.increment("a", Instant::now()).await.unwrap();
        let now = Instant::now();
        counter
            .mark_blocked("a", now + Duration::from_secs(30), now)
            .await
            .unwrap();

        let snapshot = counter.increment("a", Instant::now()).await.unwrap();
        assert!(snapshot.blocked);
        assert_eq!(snapshot.count, 2);
        assert_eq!(store.value("test:count:a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_block_and_count_lapse_together() {
        let (_store, counter) = store_counter();

        for _ in 0..3 {
            counter.increment("a", Instant::now()).await.unwrap();
        }
        let now = Instant::now();
        counter
            .mark_blocked("a", now + Duration::from_secs(5), now)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let snapshot = counter.increment("a", Instant::now()).await.unwrap();
        assert!(!snapshot.blocked);
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_block_ttl_measured_from_given_instant() {
        let (store, counter) = store_counter();
        let start = Instant::now();

        counter.increment("a", start).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        // Written 4s late, the block still runs for its full duration.
        counter
            .mark_blocked("a", start + Duration::from_secs(10), start)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(counter.increment("a", Instant::now()).await.unwrap().blocked);
        assert_eq!(store.value("test:block:a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_keys_accessor() {
        let (_store, counter) = store_counter();
        assert_eq!(counter.keys().prefix(), "test:");
    }
}
