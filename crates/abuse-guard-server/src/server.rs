//! Server assembly and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use abuse_guard::{AbuseDetector, RedisCounterStore};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::Args;
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;

/// Upper bound on the initial Redis connection attempt.
const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the detector described by `args`.
///
/// When a Redis URL is configured but the server cannot be reached, a warning
/// is logged and the detector runs with local tracking only.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub async fn build_detector(args: &Args) -> ServerResult<AbuseDetector> {
    let config = args.to_guard_config()?;
    let detector = AbuseDetector::new(config)?;

    let Some(url) = args.redis_url.as_deref() else {
        info!("No shared store configured, tracking clients locally");
        return Ok(detector);
    };

    match tokio::time::timeout(STORE_CONNECT_TIMEOUT, RedisCounterStore::connect(url)).await {
        Ok(Ok(store)) => {
            info!("Connected to shared counter store");
            Ok(detector.with_store(Arc::new(store)))
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Shared counter store unavailable, tracking clients locally");
            Ok(detector)
        }
        Err(_) => {
            warn!(
                timeout_ms = STORE_CONNECT_TIMEOUT.as_millis(),
                "Shared counter store connection timed out, tracking clients locally"
            );
            Ok(detector)
        }
    }
}

/// HTTP server fronted by the abuse guard.
#[derive(Debug, Clone)]
pub struct GuardServer {
    detector: Arc<AbuseDetector>,
    addr: SocketAddr,
}

impl GuardServer {
    /// Create a server for the given detector.
    #[must_use]
    pub const fn new(detector: Arc<AbuseDetector>, addr: SocketAddr) -> Self {
        Self { detector, addr }
    }

    /// Address the server binds to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared detector.
    #[must_use]
    pub fn detector(&self) -> Arc<AbuseDetector> {
        self.detector.clone()
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(self.detector.clone())
    }

    /// Run until `shutdown` completes.
    ///
    /// The stale-entry sweeper runs for the lifetime of the server.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails or the server
    /// encounters a fatal error.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.addr, e))?;

        info!(
            addr = %self.addr,
            enabled = self.detector.config().enabled,
            shared_store = self.detector.uses_store(),
            "Guard server listening"
        );

        let sweeper = self.detector.spawn_sweeper();

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;

        sweeper.shutdown();
        info!("Guard server shut down");
        Ok(())
    }
}
