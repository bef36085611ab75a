//! Error types for the Ratekeeper service.

use thiserror::Error;

use crate::backend::BackendError;
use crate::ratelimit::bucket::CodecError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored bucket could not be decoded
    #[error("Corrupt bucket at {key}: {source}")]
    CorruptBucket {
        key: String,
        #[source]
        source: CodecError,
    },

    /// The backing store failed, timed out or was unreachable
    #[error("Backing store unavailable: {0}")]
    Backend(#[from] BackendError),

    /// Concurrent bucket creation kept racing past the retry bound
    #[error("Gave up on {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: usize },

    /// The request key could not be derived
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    /// Whether the error came from talking to the backing store.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Contention { .. })
    }
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
