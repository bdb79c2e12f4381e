//! Error types shared across the backend.

use ash::vk;
use thiserror::Error;

/// Convenience alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors produced by controller and driver operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A graphics API call returned an error code.
    #[error("graphics API error: {0}")]
    Api(vk::Result),

    /// A handle no longer resolves to a live resource.
    #[error("stale {kind} handle")]
    StaleHandle {
        /// Resource kind the handle referred to.
        kind: &'static str,
    },

    /// The requested operation is not valid in the current state.
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// What went wrong.
        reason: String,
    },

    /// A memory allocation could not be satisfied.
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes.
        requested: u64,
    },

    /// Device or subsystem initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Importing an external image failed partway through.
    #[error("native image import failed at {step}: {reason}")]
    NativeImageImport {
        /// The import step that failed.
        step: &'static str,
        /// Driver-reported reason.
        reason: String,
    },

    /// The device cannot express the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// File I/O failed (pipeline cache persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Shorthand for an [`BackendError::InvalidOperation`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        BackendError::InvalidOperation { reason: reason.into() }
    }
}
