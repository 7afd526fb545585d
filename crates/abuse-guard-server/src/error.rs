//! Error types for the guard server.

use std::net::SocketAddr;

use abuse_guard::GuardError;
use thiserror::Error;

/// Errors that can occur while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Detector configuration is invalid.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
