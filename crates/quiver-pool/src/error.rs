//! Error types for pool operations
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type surfaced by checkout and lifecycle operations.
///
/// Failures internal to maintenance (match misses, cleanup failures,
/// destroy failures, fill failures) are absorbed and logged rather than
/// surfaced; the variants here are the ones a caller can observe.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// No permit became available within the blocking timeout
    #[error("no managed connections available within configured blocking timeout ({timeout_ms} ms)")]
    NoCapacity {
        /// The configured blocking timeout in milliseconds
        timeout_ms: u64,
    },

    /// The pool has been shut down
    #[error("the pool has been shut down")]
    ShuttingDown,

    /// The factory failed while manufacturing a new managed connection
    #[error("unexpected error while trying to create a connection")]
    CreateFailed {
        /// The underlying factory error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The caller was cancelled while waiting for a permit
    #[error("interrupted while requesting permit, waited {waited_ms} ms")]
    Interrupted {
        /// How long the caller had been waiting when it was cancelled
        waited_ms: u64,
    },

    /// A factory collaborator reported a resource-level failure
    #[error("resource error: {message}")]
    Resource {
        /// The error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a resource error with a message only
    pub fn resource<S: Into<String>>(message: S) -> Self {
        Self::Resource {
            message: message.into(),
            source: None,
        }
    }

    /// Create a resource error wrapping an underlying cause
    pub fn resource_with<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Resource {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn create_failed(source: Error) -> Self {
        Self::CreateFailed {
            source: Box::new(source),
        }
    }

    /// Check if this error is retryable.
    ///
    /// A shut-down sub-pool is retryable because a different sub-pool may
    /// still serve the request; a capacity timeout may succeed on a later
    /// attempt once a connection is returned.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::NoCapacity { .. })
    }
}
