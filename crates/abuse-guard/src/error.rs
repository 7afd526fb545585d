//! Error types for abuse detection.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in abuse detection operations.
///
/// Only [`GuardError::Config`] ever reaches a caller of the detector; store
/// errors are contained inside a single evaluation and trigger local tracking.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Configuration error, raised once at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared counter store is not configured or cannot be reached.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Shared counter store did not answer in time.
    #[error("Counter store timed out after {}ms", .0.as_millis())]
    StoreTimeout(Duration),

    /// Shared counter store returned an error.
    #[error("Counter store error: {0}")]
    Store(String),
}

impl GuardError {
    /// Whether this error comes from the shared counter store.
    #[must_use]
    pub const fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::StoreTimeout(_) | Self::Store(_)
        )
    }
}

/// Result type for abuse detection operations.
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = GuardError::Config("block_threshold must be positive".into());
        assert!(err.to_string().contains("block_threshold"));
        assert!(!err.is_store_error());
    }

    #[test]
    fn test_error_display_timeout() {
        let err = GuardError::StoreTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Counter store timed out after 250ms");
        assert!(err.is_store_error());
    }

    #[test]
    fn test_store_errors_are_classified() {
        assert!(GuardError::StoreUnavailable("down".into()).is_store_error());
        assert!(GuardError::Store("WRONGTYPE".into()).is_store_error());
    }
}
