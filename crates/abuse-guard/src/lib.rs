//! # abuse-guard
//!
//! Per-client request abuse detection for HTTP services.
//!
//! Every inbound request is attributed to a client identifier (its source
//! address), counted within a fixed window and classified:
//!
//! - **Allowed** - below the request threshold
//! - **Suspicious** - at or above the request threshold; logged, still served
//! - **Blocked** - at or above the block threshold; rejected with 429 until
//!   the block duration has elapsed
//!
//! ## Components
//!
//! - [`AbuseDetector`] - classification, block placement and statistics
//! - [`LocalCounter`] / [`StoreBackedCounter`] - the two counting strategies
//! - [`CounterStore`] - shared key-value store for multi-process deployments,
//!   with [`MemoryCounterStore`] and (feature `redis`) `RedisCounterStore`
//! - [`EventSink`] - destination for suspicious/blocked events
//! - [`abuse_guard_middleware`] - axum middleware writing the 429 response
//!
//! When the shared store errors or times out, that evaluation silently falls
//! back to process-local tracking with the same semantics.
//!
//! # Example
//!
//! ```rust
//! use abuse_guard::{AbuseDetector, GuardConfig, RequestInfo, Verdict};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), abuse_guard::GuardError> {
//! let config = GuardConfig::builder()
//!     .request_threshold(3)
//!     .block_threshold(5)
//!     .build();
//! let detector = AbuseDetector::new(config)?;
//!
//! let request = RequestInfo::new("10.0.0.5", "/api/posts", "GET");
//! assert_eq!(detector.evaluate(&request).await, Verdict::Allowed);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod counter;
pub mod detector;
pub mod error;
pub mod events;
pub mod middleware;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

// Re-export main types
pub use config::{GuardConfig, GuardConfigBuilder, MAX_DURATION, StoreConfig};
pub use counter::{ClientCounter, CounterSnapshot, LocalCounter, RequestCounter, StoreBackedCounter};
pub use detector::{AbuseDetector, DetectorStats, RequestInfo, SweeperHandle, UNKNOWN_CLIENT, Verdict};
pub use error::{GuardError, GuardResult};
pub use events::{EventSink, GuardEvent, GuardEventKind, NoopEventSink, TracingEventSink};
pub use middleware::{BlockedResponse, DDOS_DETECTED, abuse_guard_middleware, client_identifier};
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use store::{ClientKeys, CounterStore, MemoryCounterStore, StoreCount, StoreKeys};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::GuardConfig;
    pub use crate::detector::{AbuseDetector, RequestInfo, Verdict};
    pub use crate::error::{GuardError, GuardResult};
    pub use crate::middleware::abuse_guard_middleware;
    pub use crate::store::{CounterStore, MemoryCounterStore};
}
