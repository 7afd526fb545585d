//! Abuse detection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};

/// Default namespace for keys written to the shared counter store.
pub const DEFAULT_KEY_PREFIX: &str = "ddos:";

/// Longest accepted window, block duration, sweep interval or store timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for the shared counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Whether a configured store is consulted at all.
    pub enabled: bool,
    /// Prefix for every key this detector owns in the store.
    pub key_prefix: String,
    /// Upper bound on a single store round trip.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Main abuse detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// When false, every request is allowed and no state is kept.
    pub enabled: bool,
    /// Width of the counting window.
    pub window: Duration,
    /// Count at or above which a request is flagged suspicious.
    pub request_threshold: u64,
    /// Count at or above which the client is blocked.
    pub block_threshold: u64,
    /// How long a block stays in effect.
    pub block_duration: Duration,
    /// Interval of the local eviction sweep.
    pub sweep_interval: Duration,
    /// Shared counter store settings.
    pub store: StoreConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            request_threshold: 100,
            block_threshold: 200,
            block_duration: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(30),
            store: StoreConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Create a new builder for the configuration.
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::default()
    }

    /// Check that the configuration can drive a detector.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::Config` describing the first invalid option.
    pub fn validate(&self) -> GuardResult<()> {
        check_duration("window", self.window)?;
        if self.request_threshold == 0 {
            return Err(GuardError::Config("request_threshold must be positive".into()));
        }
        if self.block_threshold == 0 {
            return Err(GuardError::Config("block_threshold must be positive".into()));
        }
        if self.request_threshold > self.block_threshold {
            return Err(GuardError::Config(format!(
                "request_threshold ({}) must not exceed block_threshold ({})",
                self.request_threshold, self.block_threshold
            )));
        }
        check_duration("block_duration", self.block_duration)?;
        check_duration("sweep_interval", self.sweep_interval)?;
        if self.store.key_prefix.is_empty() {
            return Err(GuardError::Config("store key_prefix must not be empty".into()));
        }
        check_duration("store timeout", self.store.timeout)?;
        Ok(())
    }
}

fn check_duration(name: &str, value: Duration) -> GuardResult<()> {
    if value.is_zero() {
        return Err(GuardError::Config(format!("{name} must be positive")));
    }
    if value > MAX_DURATION {
        return Err(GuardError::Config(format!(
            "{name} must not exceed {}s, got {}s",
            MAX_DURATION.as_secs(),
            value.as_secs()
        )));
    }
    Ok(())
}

/// Builder for `GuardConfig`.
#[derive(Debug, Clone, Default)]
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    /// Turn detection on or off.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the counting window.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Set the suspicious threshold.
    #[must_use]
    pub const fn request_threshold(mut self, threshold: u64) -> Self {
        self.config.request_threshold = threshold;
        self
    }

    /// Set the block threshold.
    #[must_use]
    pub const fn block_threshold(mut self, threshold: u64) -> Self {
        self.config.block_threshold = threshold;
        self
    }

    /// Set the block duration.
    #[must_use]
    pub const fn block_duration(mut self, duration: Duration) -> Self {
        self.config.block_duration = duration;
        self
    }

    /// Set the local sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the shared store configuration.
    #[must_use]
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> GuardConfig {
        self.config
    }
}
