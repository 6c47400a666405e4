//! Unified error handling for DevHub.
//!
//! Layer-specific errors (adapter, integration, store) convert into this type
//! at crate boundaries that do not need the finer taxonomy.

/// Unified error type for DevHub.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Device-related errors.
    #[error("Device error: {0}")]
    Device(String),

    /// Network-related errors.
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication/authorization errors.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout errors.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// Result alias using the unified error.
pub type Result<T> = std::result::Result<T, Error>;
