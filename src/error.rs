/*!
 * Error types for Vigil
 */

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VigilError>;

/// Exit code constants for the CLI
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

#[derive(Debug, Error)]
pub enum VigilError {
    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// One-shot protocol misuse (double flush, flush after clear, ...)
    #[error("Audit context state conflict: {0}")]
    StateConflict(&'static str),

    /// Record store failure
    #[error("Record store error: {0}")]
    Store(String),

    /// Sink or lookup policy failure
    #[error("Audit policy error: {0}")]
    Policy(String),

    /// Export pipeline failure
    #[error("Export error: {0}")]
    Export(String),

    /// Export was cancelled by its consumer
    #[error("Export cancelled")]
    Cancelled,

    /// Archive sink or transport failure
    #[error("Archive error: {0}")]
    Archive(String),

    /// Cluster lock failure
    #[error("Cluster lock error: {0}")]
    Lock(String),

    /// Download session failure
    #[error("Download error: {0}")]
    Download(String),

    /// Unknown or expired download token
    #[error("Unknown download session: {0}")]
    UnknownSession(String),

    /// Archive digest or signature did not verify
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Record model error (levels, catalog, signing)
    #[error(transparent)]
    Audit(#[from] vigil_core_audit::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Zip container error
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl VigilError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            VigilError::Config(_) => EXIT_CONFIG,
            VigilError::Integrity(_) => EXIT_INTEGRITY,
            _ => EXIT_FAILURE,
        }
    }

    /// Check if this error is fatal (must not be swallowed or retried)
    ///
    /// State conflicts indicate a broken audit-context invariant; configuration
    /// errors halt the background job that hit them.
    pub fn is_fatal(&self) -> bool {
        match self {
            VigilError::StateConflict(_) => true,
            VigilError::Config(_) => true,
            VigilError::Integrity(_) => true,

            VigilError::Store(_) => false,
            VigilError::Policy(_) => false,
            VigilError::Export(_) => false,
            VigilError::Cancelled => false,
            VigilError::Archive(_) => false,
            VigilError::Lock(_) => false,
            VigilError::Download(_) => false,
            VigilError::UnknownSession(_) => false,
            VigilError::Audit(_) => false,
            VigilError::Io(_) => false,
            VigilError::Zip(_) => false,
            VigilError::Json(_) => false,
            #[cfg(feature = "sqlite")]
            VigilError::Sqlite(_) => false,
        }
    }

    /// Check if this error is transient (worth retrying on the next tick)
    pub fn is_transient(&self) -> bool {
        match self {
            VigilError::Io(io_err) => Self::is_io_transient(io_err),
            VigilError::Store(_) | VigilError::Archive(_) | VigilError::Lock(_) => true,
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conflict_is_fatal() {
        let err = VigilError::StateConflict("flush called twice");
        assert!(err.is_fatal());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("flush called twice"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(VigilError::Config("x".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(VigilError::Integrity("x".into()).exit_code(), EXIT_INTEGRITY);
        assert_eq!(VigilError::Store("x".into()).exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_transient_io() {
        let err = VigilError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());
        let err = VigilError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_audit_error_conversion() {
        let err: VigilError = vigil_core_audit::Error::UnknownMessage(7).into();
        assert!(matches!(err, VigilError::Audit(_)));
        assert!(err.to_string().contains('7'));
    }
}
