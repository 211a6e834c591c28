//! Unified error type for the infrastructure shared by all crates.

use std::fmt::Debug;
use thiserror::Error;

/// Result alias for [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;

/// Infrastructure errors that are not tied to a single job.
///
/// The jobs crate converts these into its own error type at the boundary,
/// so callers of the queue API only ever see one error enum.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backing store unreachable or returned an unexpected reply.
    #[error("Store error: {0}")]
    Store(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tracing subscriber could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if the operation that produced this error may succeed when retried.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
