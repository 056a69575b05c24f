//! Error types for the audit record model

use thiserror::Error;

/// Result type for audit model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, parsing or signing audit records
#[derive(Error, Debug)]
pub enum Error {
    /// Severity name or value could not be parsed
    #[error("Invalid audit level: {0}")]
    InvalidLevel(String),

    /// Service identifier is not 32 hex characters
    #[error("Invalid service identifier: {0}")]
    InvalidServiceId(String),

    /// Entity kind name is not recognised
    #[error("Invalid entity kind: {0}")]
    InvalidEntityKind(String),

    /// Detail message id is not registered in the catalog
    #[error("Unknown audit detail message id: {0}")]
    UnknownMessage(i32),

    /// VIGIL_AUDIT_SECRET environment variable not set
    #[error("VIGIL_AUDIT_SECRET environment variable not set")]
    MissingSecret,

    /// Secret key material rejected
    #[error("Invalid secret key: {0}")]
    InvalidSecret(String),

    /// Signature could not be decoded or did not verify
    #[error("Signature error: {0}")]
    Signature(String),
}

impl Error {
    /// Create an invalid level error
    pub fn invalid_level<S: Into<String>>(value: S) -> Self {
        Error::InvalidLevel(value.into())
    }

    /// Create a signature error
    pub fn signature<S: Into<String>>(message: S) -> Self {
        Error::Signature(message.into())
    }
}
