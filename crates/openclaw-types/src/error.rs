//! Shared error types for the OpenClaw storage layer.

use thiserror::Error;

/// Top-level error type for storage operations.
///
/// Missing keys are never errors: `get`/`delete` normalize them to
/// `Option`/`bool` at the interface, so there is no `NotFound` variant here.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A caller supplied a malformed URI, unknown backend tag, or bad key.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A backend could not be reached (transport failure, throttling,
    /// deadline exceeded). Retrying is the caller's decision.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A cooperative file lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The operation is not part of this backend's capability set.
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        /// Backend tag (e.g. "secrets-manager").
        backend: &'static str,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A stored value could not be decoded by any recovery path.
    #[error("Corrupt stored value: {0}")]
    Corruption(String),

    /// The storage configuration is malformed or incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value failed to serialize or deserialize.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with StorageError.
pub type StorageResult<T> = Result<T, StorageError>;
