//! Integration layer errors.

use devhub_devices::AdapterError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Device store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record conflict: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<IntegrationError> for devhub_core::Error {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::DeviceNotFound(id) => devhub_core::Error::NotFound(id),
            IntegrationError::PermissionDenied(msg) => devhub_core::Error::Auth(msg),
            IntegrationError::Store(e) => devhub_core::Error::Storage(e.to_string()),
            IntegrationError::Adapter(e) => devhub_core::Error::Device(e.to_string()),
            IntegrationError::Config(msg) => devhub_core::Error::Config(msg),
        }
    }
}
