//! Error types for the admission gate.
//!
//! A denied request is not an error: it is reported through
//! [`Decision`](crate::gate::Decision). Store failures are recovered inside
//! the distributed limiter and never reach this type.

use thiserror::Error;

/// Main error type for gate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Invalid or incomplete configuration, e.g. an endpoint with no
    /// applicable policy or a zero-length window.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for GateError {
    fn from(err: ::config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
