//! Error taxonomy shared by every store and operation

use thiserror::Error;

/// Errors surfaced by evergreen operations
///
/// `NotFound` and `Malformed` are usually absorbed by the operation that hits
/// them (a missing snapshot means "fresh start", a corrupt line is skipped).
/// `Storage` is always fatal to the triggering call.
#[derive(Debug, Error)]
pub enum Error {
    /// No matching session, snapshot or record
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored artifact failed to parse
    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },

    /// I/O or transaction failure on a durable store
    #[error("storage failure: {0}")]
    Storage(String),

    /// A required request field is missing or empty
    #[error("{0}")]
    Validation(String),
}

impl Error {
    pub fn malformed(what: impl Into<String>, reason: impl ToString) -> Self {
        Error::Malformed {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::Storage(format!("database query failed: {}", e))
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        Error::Storage(format!("could not get a database connection: {}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(format!("i/o error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let err = Error::malformed("snapshot", "expected value at line 1");
        assert_eq!(err.to_string(), "malformed snapshot: expected value at line 1");

        let err = Error::Validation("workspace is required".to_string());
        assert_eq!(err.to_string(), "workspace is required");
    }

    #[test]
    fn test_io_errors_become_storage_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!err.is_not_found());
    }
}
