//! Error taxonomy shared by the registries, the lifecycle controller and the
//! telemetry aggregator.

use std::time::Duration;
use thiserror::Error;

use crate::db::DbError;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input. Never retried.
    #[error("{0}")]
    Validation(String),
    /// An invariant would be violated; the caller has to change something first.
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Illegal state transition attempt.
    #[error("{0}")]
    Precondition(String),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    /// The capability is not backed by real telemetry.
    #[error("{0} is not available")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(DbError),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => Error::NotFound(what),
            DbError::Invalid(msg) => Error::Validation(msg),
            DbError::Conflict(msg) => Error::Conflict(msg),
            DbError::Precondition(msg) => Error::Precondition(msg),
            other => Error::Storage(other),
        }
    }
}

/// Non-fatal inconsistency between local state and the engine.
///
/// Logged and written to the audit log, never returned as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub subject: String,
    pub detail: String,
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_errors_map_to_taxonomy() {
        assert!(matches!(Error::from(DbError::Invalid("x".into())), Error::Validation(_)));
        assert!(matches!(Error::from(DbError::Conflict("x".into())), Error::Conflict(_)));
        assert!(matches!(Error::from(DbError::Poisoned), Error::Storage(_)));
        assert_eq!(
            Error::from(DbError::NotFound("node 'n1'".into())).to_string(),
            "node 'n1' not found"
        );
    }
}
