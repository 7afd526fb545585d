//! Request classification.
//!
//! [`AbuseDetector`] attributes each request to a client identifier, counts it
//! within a fixed window and classifies it as allowed, suspicious or blocked.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::GuardConfig;
use crate::counter::{
    CounterFuture, CounterSnapshot, LocalCounter, RequestCounter, StoreBackedCounter,
};
use crate::error::{GuardError, GuardResult};
use crate::events::{EventSink, GuardEvent, GuardEventKind, TracingEventSink};
use crate::store::{CounterStore, StoreKeys, expiry_after};

/// Identifier used when the client address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Classification of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Below every threshold.
    Allowed,
    /// At or above the request threshold; the request still proceeds.
    Suspicious,
    /// The client is blocked; the request must be rejected.
    Blocked,
}

impl Verdict {
    /// Whether the request may continue down the pipeline.
    #[must_use]
    pub const fn proceeds(&self) -> bool {
        !matches!(self, Self::Blocked)
    }

    /// Check if the verdict is a plain allow.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Check if the verdict is a block.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

/// The parts of a request the detector looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Client identifier, normally the source address.
    pub identifier: String,
    /// Request path, for events.
    pub path: String,
    /// Request method, for events.
    pub method: String,
}

impl RequestInfo {
    /// Describe a request. A blank identifier becomes [`UNKNOWN_CLIENT`].
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        let identifier = identifier.into();
        let identifier = if identifier.trim().is_empty() {
            UNKNOWN_CLIENT.to_string()
        } else {
            identifier
        };
        Self {
            identifier,
            path: path.into(),
            method: method.into(),
        }
    }
}

/// Snapshot of detector activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    /// Requests evaluated while enabled.
    pub evaluated: u64,
    /// Requests classified as allowed.
    pub allowed: u64,
    /// Requests classified as suspicious.
    pub suspicious: u64,
    /// Requests classified as blocked.
    pub blocked: u64,
    /// Store calls that failed or timed out and were served locally.
    pub store_fallbacks: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    evaluated: AtomicU64,
    allowed: AtomicU64,
    suspicious: AtomicU64,
    blocked: AtomicU64,
    store_fallbacks: AtomicU64,
}

impl StatsCounters {
    fn record(&self, verdict: Verdict) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let slot = match verdict {
            Verdict::Allowed => &self.allowed,
            Verdict::Suspicious => &self.suspicious,
            Verdict::Blocked => &self.blocked,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DetectorStats {
        DetectorStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            suspicious: self.suspicious.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            store_fallbacks: self.store_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.evaluated,
            &self.allowed,
            &self.suspicious,
            &self.blocked,
            &self.store_fallbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Sliding-window abuse detector.
///
/// Counts go to the shared store when one is attached and enabled; any store
/// error or timeout is absorbed and that single evaluation is served by the
/// process-local counter instead.
pub struct AbuseDetector {
    config: GuardConfig,
    local: LocalCounter,
    store: Option<StoreBackedCounter>,
    events: Arc<dyn EventSink>,
    stats: StatsCounters,
}

impl fmt::Debug for AbuseDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbuseDetector")
            .field("config", &self.config)
            .field("local", &self.local)
            .field("store", &self.store)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl AbuseDetector {
    /// Create a detector with local tracking only.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::Config` if the configuration is invalid.
    pub fn new(config: GuardConfig) -> GuardResult<Self> {
        config.validate()?;
        let local = LocalCounter::new(config.window);
        Ok(Self {
            config,
            local,
            store: None,
            events: Arc::new(TracingEventSink),
            stats: StatsCounters::default(),
        })
    }

    /// Attach a shared counter store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        let keys = StoreKeys::new(self.config.store.key_prefix.clone());
        self.store = Some(StoreBackedCounter::new(store, keys, self.config.window));
        self
    }

    /// Replace the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    // ==================== Evaluation ====================

    /// Classify a request arriving now.
    pub async fn evaluate(&self, request: &RequestInfo) -> Verdict {
        self.evaluate_at(request, Instant::now()).await
    }

    /// Classify a request arriving at `now`.
    ///
    /// Never fails: store trouble is absorbed and served locally.
    pub async fn evaluate_at(&self, request: &RequestInfo, now: Instant) -> Verdict {
        if !self.config.enabled {
            return Verdict::Allowed;
        }

        let identifier = request.identifier.as_str();
        let block_threshold = self.config.block_threshold;
        let request_threshold = self.config.request_threshold;
        let (snapshot, counter) = self.count(identifier, now).await;

        let verdict = if snapshot.blocked {
            self.emit(request, GuardEventKind::BlockedRepeat, snapshot.count, block_threshold);
            Verdict::Blocked
        } else if snapshot.count >= block_threshold {
            self.block(counter, identifier, now).await;
            self.emit(request, GuardEventKind::Blocked, snapshot.count, block_threshold);
            Verdict::Blocked
        } else if snapshot.count >= request_threshold {
            self.emit(request, GuardEventKind::Suspicious, snapshot.count, request_threshold);
            Verdict::Suspicious
        } else {
            Verdict::Allowed
        };

        self.stats.record(verdict);
        verdict
    }

    fn active_store(&self) -> Option<&StoreBackedCounter> {
        if self.config.store.enabled {
            self.store.as_ref()
        } else {
            None
        }
    }

    /// Count on the store if possible, otherwise locally.
    ///
    /// Returns the counter that served the request so a resulting block lands
    /// on the same tier. A block held locally wins over the store, which may
    /// have missed it.
    async fn count(
        &self,
        identifier: &str,
        now: Instant,
    ) -> (CounterSnapshot, &dyn RequestCounter) {
        if let Some(snapshot) = self.local.active_block(identifier, now) {
            return (snapshot, &self.local);
        }

        if let Some(store) = self.active_store() {
            match self.bounded(store.increment(identifier, now)).await {
                Ok(snapshot) => return (snapshot, store),
                Err(e) => self.note_fallback(identifier, &e),
            }
        }
        (self.local.increment_now(identifier, now), &self.local)
    }

    /// Record the block on `counter`, or locally if that fails.
    async fn block(&self, counter: &dyn RequestCounter, identifier: &str, now: Instant) {
        let until = expiry_after(now, self.config.block_duration);

        if let Err(e) = self.bounded(counter.mark_blocked(identifier, until, now)).await {
            self.note_fallback(identifier, &e);
            self.local.block_now(identifier, until, now);
        }
    }

    /// Run a counter operation under the store timeout.
    async fn bounded<T>(&self, operation: CounterFuture<'_, T>) -> GuardResult<T> {
        let limit = self.config.store.timeout;
        tokio::time::timeout(limit, operation)
            .await
            .unwrap_or_else(|_| Err(GuardError::StoreTimeout(limit)))
    }

    fn note_fallback(&self, identifier: &str, error: &GuardError) {
        self.stats.store_fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(
            identifier = %identifier,
            error = %error,
            "Counter store unavailable, using local tracking"
        );
    }

    fn emit(&self, request: &RequestInfo, kind: GuardEventKind, count: u64, threshold: u64) {
        self.events.record(&GuardEvent {
            kind,
            identifier: request.identifier.clone(),
            path: request.path.clone(),
            method: request.method.clone(),
            count,
            threshold,
        });
    }

    // ==================== Maintenance ====================

    /// Evict stale local records and expired in-memory store keys.
    ///
    /// Returns the number of evicted local records.
    pub fn sweep(&self) -> usize {
        if let Some(store) = &self.store {
            store.purge_expired();
        }
        self.local.sweep(Instant::now())
    }

    /// Drop all local state and zero the statistics.
    pub fn reset(&self) {
        info!("Resetting abuse detector state");
        self.local.clear();
        self.stats.reset();
    }

    /// Start the periodic eviction sweep.
    ///
    /// The task holds only a weak reference and ends on its own once the
    /// detector is dropped. Dropping the handle stops it as well.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let detector: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(detector) = detector.upgrade() else {
                    debug!("Abuse detector dropped, stopping sweeper");
                    break;
                };
                detector.sweep();
            }
        });

        SweeperHandle { task }
    }

    // ==================== Statistics ====================

    /// Get a snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        self.stats.snapshot()
    }

    /// Get the number of identifiers tracked locally.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.local.tracked_count()
    }

    // ==================== Configuration Access ====================

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Get a reference to the local counter.
    #[must_use]
    pub const fn local(&self) -> &LocalCounter {
        &self.local
    }

    /// Whether a shared store is attached and enabled.
    #[must_use]
    pub fn uses_store(&self) -> bool {
        self.active_store().is_some()
    }
}

/// Handle to the background sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep task.
    pub fn shutdown(self) {
        drop(self);
    }

    /// Whether the sweep task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
