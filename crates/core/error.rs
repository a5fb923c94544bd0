//! Error types for the mbj enqueueing library.

use thiserror::Error;

/// The main error type for the mbj library.
#[derive(Error, Debug)]
pub enum MbjError {
    /// Malformed configuration (pool size, pool timeout, connection settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Strict mode is on and the worker class has no definition.
    #[error(
        "Worker {0:?} is not defined and strict mode is enabled. \
         Add it to the configured workers or disable strict mode"
    )]
    NotDefinedWorker(String),

    /// No adapter is registered under the requested backend key.
    #[error("Backend {backend:?} is not implemented. Please use one of {available:?}")]
    UnsupportedBackend {
        /// The requested backend key.
        backend: String,
        /// Registered backend keys.
        available: Vec<String>,
    },

    /// A raw payload could not be turned back into a worker.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Unknown uniqueness scope.
    #[error("Invalid `across: {0:?}` option. Only [\"queue\", \"systemwide\"] are allowed")]
    InvalidLockScope(String),

    /// Unknown unlock policy.
    #[error("Invalid `unlock_policy: {0:?}` option. Only [\"success\", \"start\"] are allowed")]
    InvalidUnlockPolicy(String),

    /// A value could not be interpreted as a point in time.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store (Redis or equivalent) operation error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Network protocol transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout error, e.g. waiting for a pooled connection.
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias using MbjError.
pub type Result<T> = std::result::Result<T, MbjError>;
