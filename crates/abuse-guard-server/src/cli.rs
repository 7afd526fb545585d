//! Command-line interface definition.
//!
//! Every flag can also be supplied through the environment variable named
//! in its `env` attribute.

use std::net::SocketAddr;
use std::time::Duration;

use abuse_guard::{GuardConfig, StoreConfig};
use clap::Parser;
use clap::builder::BoolishValueParser;

use crate::error::ServerResult;

/// Request pipeline guarded by per-client abuse detection.
#[derive(Debug, Clone, Parser)]
#[command(name = "abuse-guard-server")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Enable abuse detection.
    #[arg(
        long,
        env = "DDOS_PROTECTION_ENABLED",
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    pub enabled: bool,

    /// Counting window in seconds.
    #[arg(long, env = "DDOS_WINDOW_SECONDS", default_value_t = 60)]
    pub window_seconds: u64,

    /// Requests per window at which a client is flagged as suspicious.
    #[arg(long, env = "DDOS_REQUEST_THRESHOLD", default_value_t = 100)]
    pub request_threshold: u64,

    /// Requests per window at which a client is blocked.
    #[arg(long, env = "DDOS_BLOCK_THRESHOLD", default_value_t = 200)]
    pub block_threshold: u64,

    /// Block duration in seconds.
    #[arg(long, env = "DDOS_BLOCK_DURATION", default_value_t = 300)]
    pub block_duration: u64,

    /// Interval between sweeps of stale local entries, in seconds.
    #[arg(long, env = "DDOS_SWEEP_INTERVAL_SECONDS", default_value_t = 30)]
    pub sweep_interval_seconds: u64,

    /// Timeout for a single shared store call, in milliseconds.
    #[arg(long, env = "DDOS_STORE_TIMEOUT_MS", default_value_t = 250)]
    pub store_timeout_ms: u64,

    /// Prefix for keys written to the shared store.
    #[arg(long, env = "DDOS_KEY_PREFIX", default_value = abuse_guard::config::DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Redis URL for shared counters. Local tracking only when unset.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,
}

impl Args {
    /// Build and validate the detector configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn to_guard_config(&self) -> ServerResult<GuardConfig> {
        let config = GuardConfig::builder()
            .enabled(self.enabled)
            .window(Duration::from_secs(self.window_seconds))
            .request_threshold(self.request_threshold)
            .block_threshold(self.block_threshold)
            .block_duration(Duration::from_secs(self.block_duration))
            .sweep_interval(Duration::from_secs(self.sweep_interval_seconds))
            .store(StoreConfig {
                enabled: self.redis_url.is_some(),
                key_prefix: self.key_prefix.clone(),
                timeout: Duration::from_millis(self.store_timeout_ms),
            })
            .build();

        config.validate()?;
        Ok(config)
    }
}
