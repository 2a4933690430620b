//! Throttling engine error types.
//!
//! Shutting-down is deliberately not an error: acquisition operations
//! signal it through their return values (`None` handles, `false`
//! permissions, the `u32::MAX` quota sentinel) so callers can abandon a
//! work unit without unwinding.

use thiserror::Error;

/// Result type for throttler operations.
pub type ThrottleResult<T> = Result<T, ThrottleError>;

/// Errors from throttler lifecycle operations.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("service registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors from service registry collaborators.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no active service {service_name} of type {service_type}")]
    UnknownService {
        service_type: String,
        service_name: String,
    },
    #[error("{0}")]
    Other(String),
}
